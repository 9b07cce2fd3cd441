//! HTTP-01 responder: serves key authorizations registered by pending
//! challenges under the well-known path.

use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use warp::Filter;
use warp::http::Method;
use warp::path::FullPath;

use super::ChallengeProvider;
use crate::Result;
use crate::haproxy::ACME_URL_PREFIX;

/// Answer for requests matching no pending challenge.
const FALLBACK_BODY: &str = "TEST";

#[derive(Debug, Default)]
pub struct HttpProvider {
    /// key authorization by `token@domain`
    challenges: Mutex<HashMap<String, String>>,
}

fn challenge_key(domain: &str, token: &str) -> String {
    format!("{token}@{domain}")
}

impl HttpProvider {
    fn lookup(&self, domain: &str, token: &str) -> Option<String> {
        let challenges = self.challenges.lock().unwrap_or_else(|e| e.into_inner());
        challenges.get(&challenge_key(domain, token)).cloned()
    }

    /// Responds to any method and path; only a GET for a registered token and
    /// host returns its key authorization.
    pub fn filter(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (String,), Error = warp::Rejection> + Clone {
        warp::method()
            .and(warp::path::full())
            .and(warp::header::optional::<String>("host"))
            .map(move |method: Method, path: FullPath, host: Option<String>| {
                let path = path.as_str().trim_end_matches('/');
                let token = match path.find(ACME_URL_PREFIX) {
                    Some(i) => &path[i + ACME_URL_PREFIX.len()..],
                    None => path,
                };
                let host = host.unwrap_or_default();

                match self.lookup(&host, token) {
                    Some(key_auth) if method == Method::GET => {
                        info!("[{host}] served key authentication");
                        key_auth
                    }
                    _ => {
                        info!("no challenge for {method} {host}{path}, check the Host header");
                        FALLBACK_BODY.to_string()
                    }
                }
            })
    }

    pub async fn serve(self: Arc<Self>, bind: SocketAddr) -> Result<()> {
        let (addr, server) = warp::serve(self.filter())
            .try_bind_ephemeral(bind)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, e))?;
        info!("ACME HTTP-01 responder listening on {addr}");
        server.await;
        Ok(())
    }
}

#[async_trait]
impl ChallengeProvider for HttpProvider {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        let mut challenges = self.challenges.lock().unwrap_or_else(|e| e.into_inner());
        challenges.insert(challenge_key(domain, token), key_auth.to_string());
        Ok(())
    }

    async fn clean_up(&self, domain: &str, token: &str, _key_auth: &str) -> Result<()> {
        let mut challenges = self.challenges.lock().unwrap_or_else(|e| e.into_inner());
        challenges.remove(&challenge_key(domain, token));
        Ok(())
    }
}
