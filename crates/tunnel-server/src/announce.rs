//! Master server announcements

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a tunnel reports about itself on every heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub version: u8,
    pub name: String,
    pub port: u16,
    pub clients: usize,
    pub max_clients: usize,
    pub maintenance: bool,
}

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bad response: status={status} body={body:?}")]
    BadResponse { status: StatusCode, body: String },
}

/// Upstream sink for heartbeat announcements
#[async_trait::async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, announcement: &Announcement) -> Result<(), AnnounceError>;
}

/// Reports to the master server with an HTTP GET
pub struct MasterAnnouncer {
    url: String,
    password: String,
    client: reqwest::Client,
}

impl MasterAnnouncer {
    /// `ipv4_only` binds outgoing requests to an IPv4 source address.
    pub fn new(
        url: impl Into<String>,
        password: Option<&str>,
        ipv4_only: bool,
    ) -> Result<Self, AnnounceError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(ANNOUNCE_TIMEOUT);
        if ipv4_only {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }

        Ok(Self {
            url: url.into(),
            password: password.unwrap_or_default().to_string(),
            client: builder.build()?,
        })
    }

    fn query(&self, announcement: &Announcement) -> Vec<(&'static str, String)> {
        vec![
            ("version", announcement.version.to_string()),
            ("name", announcement.name.clone()),
            ("port", announcement.port.to_string()),
            ("clients", announcement.clients.to_string()),
            ("maxclients", announcement.max_clients.to_string()),
            ("masterpw", self.password.clone()),
            ("maintenance", u8::from(announcement.maintenance).to_string()),
        ]
    }
}

#[async_trait::async_trait]
impl Reporter for MasterAnnouncer {
    async fn report(&self, announcement: &Announcement) -> Result<(), AnnounceError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&self.query(announcement))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() && body.trim().eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(AnnounceError::BadResponse { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn announcement() -> Announcement {
        Announcement {
            version: 3,
            name: "Test Tunnel".to_string(),
            port: 50001,
            clients: 12,
            max_clients: 200,
            maintenance: true,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/announce", addr)
    }

    #[test]
    fn test_query_fields() {
        let announcer = MasterAnnouncer::new("http://localhost/announce", Some("pw"), false).unwrap();
        let query: HashMap<_, _> = announcer.query(&announcement()).into_iter().collect();

        assert_eq!(query["version"], "3");
        assert_eq!(query["name"], "Test Tunnel");
        assert_eq!(query["port"], "50001");
        assert_eq!(query["clients"], "12");
        assert_eq!(query["maxclients"], "200");
        assert_eq!(query["masterpw"], "pw");
        assert_eq!(query["maintenance"], "1");
    }

    #[tokio::test]
    async fn test_report_accepted() {
        let seen = Arc::new(Mutex::new(HashMap::new()));
        let captured = seen.clone();
        let router = Router::new().route(
            "/announce",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = params;
                    "ok"
                }
            }),
        );
        let url = serve(router).await;

        let announcer = MasterAnnouncer::new(url, None, false).unwrap();
        announcer.report(&announcement()).await.unwrap();

        let params = seen.lock().unwrap().clone();
        assert_eq!(params.get("name").map(String::as_str), Some("Test Tunnel"));
        assert_eq!(params.get("masterpw").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_report_rejected_body() {
        let router = Router::new().route("/announce", get(|| async { "DENIED" }));
        let url = serve(router).await;

        let announcer = MasterAnnouncer::new(url, None, false).unwrap();
        let result = announcer.report(&announcement()).await;
        assert!(matches!(result, Err(AnnounceError::BadResponse { body, .. }) if body == "DENIED"));
    }
}
