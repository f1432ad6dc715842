//! Declarative pieces of Caddy configuration managed by this tool
//!
//! Every object carries an `@id` so it can be read back, patched, or deleted
//! through `/id/...` without knowing where it sits in the config tree.

use crate::admin::id_path;
use crate::config::Provider;
use reqwest::Method;
use serde_json::{json, Value};

pub const SERVER_ID: &str = "devcaddy-server";
pub const SERVER_NAME: &str = "devcaddy";
pub const WILDCARD_MATCH_ID: &str = "devcaddy-wildcard-match";
pub const WILDCARD_ROUTES_ID: &str = "devcaddy-wildcard-routes";
pub const WILDCARD_TLS_ID: &str = "devcaddy-wildcard-tls";

/// Object compared and patched instead of `Entry::json` when the entry already exists
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub id: String,
    pub json: Value,
}

/// Desired state of one config object and how to create it
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Path the object is created at (PUT/POST) or removed from (DELETE)
    pub target: String,
    pub method: Method,
    pub id: String,
    pub json: Value,
    pub update: Option<Update>,
}

impl Entry {
    /// Id looked up to decide between create, update and skip
    pub fn check_id(&self) -> &str {
        self.update.as_ref().map(|u| u.id.as_str()).unwrap_or(&self.id)
    }

    /// Object expected at `check_id` once reconciled
    pub fn desired(&self) -> &Value {
        self.update.as_ref().map(|u| &u.json).unwrap_or(&self.json)
    }

    pub fn is_delete(&self) -> bool {
        self.method == Method::DELETE
    }
}

/// Id of the reverse-proxy route for a dev server port
pub fn hostname_id(dev_port: u16) -> String {
    format!("devcaddy-hostname-{}", dev_port)
}

fn wildcard_match(domain: &str) -> Value {
    json!({
        "@id": WILDCARD_MATCH_ID,
        "host": [format!("*.{}", domain)],
    })
}

/// HTTPS server for `*.<domain>` with an empty subroute that project routes are inserted into.
/// Unmatched hosts fall through to a 404.
pub fn server(domain: &str) -> Entry {
    Entry {
        id: SERVER_ID.to_string(),
        target: format!("/config/apps/http/servers/{}", SERVER_NAME),
        method: Method::PUT,
        json: json!({
            "@id": SERVER_ID,
            "listen": [":443"],
            "routes": [
                {
                    "match": [wildcard_match(domain)],
                    "handle": [
                        {
                            "@id": WILDCARD_ROUTES_ID,
                            "handler": "subroute",
                            "routes": [],
                        },
                        {
                            "handler": "static_response",
                            "status_code": 404,
                            "body": "Project \"{http.request.host}\" appears to be down.",
                        },
                    ],
                    "terminal": true,
                },
            ],
        }),
        update: Some(Update {
            id: WILDCARD_MATCH_ID.to_string(),
            json: wildcard_match(domain),
        }),
    }
}

fn tls_policy(domain: &str, provider: &Provider) -> Value {
    json!({
        "@id": WILDCARD_TLS_ID,
        "subjects": [format!("*.{}", domain)],
        "issuers": [
            {
                "module": "acme",
                "challenges": {
                    "dns": {
                        "provider": provider.to_json(),
                    },
                },
            },
        ],
    })
}

/// Automation policy obtaining a wildcard certificate through a DNS-01 challenge
pub fn tls(domain: &str, provider: &Provider) -> Entry {
    Entry {
        id: WILDCARD_TLS_ID.to_string(),
        target: "/config/apps/tls/automation/policies".to_string(),
        method: Method::PUT,
        json: Value::Array(vec![tls_policy(domain, provider)]),
        update: Some(Update {
            id: WILDCARD_TLS_ID.to_string(),
            json: tls_policy(domain, provider),
        }),
    }
}

/// Route sending `<subdomain>.<domain>` for every subdomain to `localhost:<dev_port>`.
/// New routes are inserted first in the wildcard subroute.
pub fn hostnames(subdomains: &[String], domain: &str, dev_port: u16) -> Entry {
    let id = hostname_id(dev_port);
    let hosts: Vec<Value> = subdomains
        .iter()
        .map(|subdomain| json!({ "host": [format!("{}.{}", subdomain, domain)] }))
        .collect();

    Entry {
        target: format!("{}/routes/0", id_path(WILDCARD_ROUTES_ID)),
        method: Method::PUT,
        json: json!({
            "@id": id,
            "handle": [
                {
                    "handler": "reverse_proxy",
                    "headers": {
                        "request": {
                            "set": {
                                "Host": ["{http.reverse_proxy.upstream.hostport}"],
                            },
                        },
                    },
                    "upstreams": [
                        { "dial": format!("localhost:{}", dev_port) },
                    ],
                },
            ],
            "match": hosts,
        }),
        id,
        update: None,
    }
}

/// Removal of the route for a dev server port
pub fn down(dev_port: u16) -> Entry {
    let id = hostname_id(dev_port);
    Entry {
        target: id_path(&id),
        method: Method::DELETE,
        json: json!({}),
        id,
        update: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudflareProvider;

    fn cloudflare() -> Provider {
        Provider::Cloudflare(CloudflareProvider {
            api_token: "token".to_string(),
        })
    }

    #[test]
    fn test_server_entry() {
        let entry = server("dev.example.com");

        assert_eq!(entry.method, Method::PUT);
        assert_eq!(entry.target, "/config/apps/http/servers/devcaddy");
        assert_eq!(entry.check_id(), WILDCARD_MATCH_ID);
        assert_eq!(
            entry.desired(),
            &json!({ "@id": WILDCARD_MATCH_ID, "host": ["*.dev.example.com"] })
        );

        let route = &entry.json["routes"][0];
        assert_eq!(entry.json["listen"], json!([":443"]));
        assert_eq!(route["match"][0], *entry.desired());
        assert_eq!(route["handle"][0]["@id"], WILDCARD_ROUTES_ID);
        assert_eq!(route["handle"][0]["routes"], json!([]));
        assert_eq!(route["handle"][1]["status_code"], 404);
        assert_eq!(route["terminal"], true);
    }

    #[test]
    fn test_tls_entry() {
        let entry = tls("dev.example.com", &cloudflare());

        assert_eq!(entry.target, "/config/apps/tls/automation/policies");
        assert_eq!(entry.check_id(), WILDCARD_TLS_ID);

        let policies = entry.json.as_array().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(&policies[0], entry.desired());
        assert_eq!(policies[0]["subjects"], json!(["*.dev.example.com"]));
        assert_eq!(
            policies[0]["issuers"][0]["challenges"]["dns"]["provider"],
            json!({ "name": "cloudflare", "api_token": "token" })
        );
    }

    #[test]
    fn test_hostnames_entry() {
        let subdomains = vec!["shop".to_string(), "shop-admin".to_string()];
        let entry = hostnames(&subdomains, "dev.example.com", 3000);

        assert_eq!(entry.id, "devcaddy-hostname-3000");
        assert_eq!(entry.target, "/id/devcaddy-wildcard-routes/routes/0");
        assert!(entry.update.is_none());
        assert_eq!(entry.check_id(), "devcaddy-hostname-3000");
        assert_eq!(entry.desired(), &entry.json);
        assert_eq!(
            entry.json["match"],
            json!([
                { "host": ["shop.dev.example.com"] },
                { "host": ["shop-admin.dev.example.com"] },
            ])
        );
        assert_eq!(
            entry.json["handle"][0]["upstreams"],
            json!([{ "dial": "localhost:3000" }])
        );
    }

    #[test]
    fn test_down_entry() {
        let entry = down(5173);

        assert!(entry.is_delete());
        assert_eq!(entry.id, "devcaddy-hostname-5173");
        assert_eq!(entry.target, "/id/devcaddy-hostname-5173");
    }
}
