use std::net::Ipv6Addr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, HOST};
use hyper::Request;

use crate::transport::{authority, http_exchange, request_failed, PingError, DEFAULT_TIMEOUT};

const SELTEMP_PATH: &str = "/api/thermostat/seltemp";
const DEFAULT_HTTP_PORT: u16 = 80;

pub struct EmsClient {
    hostport: String,
    access_token: String,
    timeout: Duration,
}

impl EmsClient {
    pub fn new(hostport: &str, access_token: &str) -> Self {
        // A bare IPv6 literal has colons but no port.
        let hostport = if hostport.contains(':') && hostport.parse::<Ipv6Addr>().is_err() {
            hostport.to_string()
        } else {
            authority(hostport, DEFAULT_HTTP_PORT)
        };
        Self {
            hostport,
            access_token: access_token.lines().next().unwrap_or_default().trim().to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read the thermostat set temperature, returning the raw body.
    pub async fn ping(&self) -> Result<String, PingError> {
        let request = Request::get(SELTEMP_PATH)
            .header(HOST, &self.hostport)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .body(Full::new(Bytes::new()))
            .map_err(|e| request_failed(&format!("http://{}{}", self.hostport, SELTEMP_PATH), e))?;
        let response = http_exchange(&self.hostport, request, self.timeout).await?;
        Ok(response.body)
    }
}
