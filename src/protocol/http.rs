//! JSON gateway client
//!
//! Each controller is fronted by a small gateway that translates the native
//! protocol into JSON over HTTP:
//!
//! ```text
//! GET /ping                           -> 2xx when the controller is reachable
//! GET /pmc/lamps                      -> {"bits": 1}
//! GET /status                         -> {"run": 3}
//! GET /macro/{id}                     -> {"value": 1234.0}     (404 = absent)
//! GET /program/active                 -> {"main": 11}
//! GET /program/{name}/head?max_len=N  -> text/plain            (404 = absent)
//! GET /params?ids=6757,6758           -> {"6757": 12, "6758": 3} (404 = absent)
//! ```
//!
//! The HTTP client is built once per connector and shared by every session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode as HttpStatus};
use serde::Deserialize;
use tracing::trace;

use super::{
    ActiveProgram, LampBits, ProtocolClient, ProtocolConnector, ProtocolError, ProtocolResult,
};

#[derive(Debug, Clone)]
pub struct HttpGatewayConnector {
    client: Client,
}

impl HttpGatewayConnector {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpGatewayConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolConnector for HttpGatewayConnector {
    fn open(&self, address: SocketAddr, timeout: Duration) -> Box<dyn ProtocolClient> {
        Box::new(HttpGatewayClient {
            client: self.client.clone(),
            base_url: format!("http://{address}"),
            timeout,
        })
    }
}

struct HttpGatewayClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct LampResponse {
    bits: u8,
}

#[derive(Deserialize)]
struct RunStateResponse {
    run: i64,
}

#[derive(Deserialize)]
struct MacroResponse {
    value: Option<f64>,
}

#[derive(Deserialize)]
struct ActiveProgramResponse {
    main: u32,
}

/// Walk the error chain looking for the socket error underneath.
fn classify(err: reqwest::Error) -> ProtocolError {
    if err.is_timeout() {
        return ProtocolError::Timeout(err.to_string());
    }

    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            return std::io::Error::new(io_err.kind(), err.to_string()).into();
        }
        source = std::error::Error::source(inner);
    }

    if err.is_connect() {
        return ProtocolError::Refused(err.to_string());
    }

    ProtocolError::Other(err.to_string())
}

impl HttpGatewayClient {
    /// GET a path; `Ok(None)` on 404.
    async fn get(&self, path: &str) -> ProtocolResult<Option<reqwest::Response>> {
        let url = format!("{}{path}", self.base_url);
        trace!("requesting {url}");

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify)?;

        match response.status() {
            HttpStatus::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(ProtocolError::Other(format!("{url}: HTTP {status}"))),
        }
    }

    async fn get_json<T>(&self, path: &str) -> ProtocolResult<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let Some(response) = self.get(path).await? else {
            return Ok(None);
        };
        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| ProtocolError::Other(format!("{path}: invalid body: {e}")))
    }

    async fn require_json<T>(&self, path: &str) -> ProtocolResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.get_json(path)
            .await?
            .ok_or_else(|| ProtocolError::Other(format!("{path}: not found")))
    }
}

#[async_trait]
impl ProtocolClient for HttpGatewayClient {
    async fn connect(&mut self) -> ProtocolResult<bool> {
        let url = format!("{}/ping", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify)?;
        Ok(response.status().is_success())
    }

    async fn disconnect(&mut self) -> ProtocolResult<()> {
        // stateless
        Ok(())
    }

    async fn read_status(&mut self) -> ProtocolResult<LampBits> {
        let lamps: LampResponse = self.require_json("/pmc/lamps").await?;
        Ok(LampBits(lamps.bits))
    }

    async fn read_run_state(&mut self) -> ProtocolResult<i64> {
        let state: RunStateResponse = self.require_json("/status").await?;
        Ok(state.run)
    }

    async fn read_counter(&mut self, id: u32) -> ProtocolResult<Option<i64>> {
        let value = self
            .get_json::<MacroResponse>(&format!("/macro/{id}"))
            .await?
            .and_then(|m| m.value);
        Ok(value.map(|v| v.round() as i64))
    }

    async fn read_program_header(
        &mut self,
        program: &str,
        max_len: usize,
    ) -> ProtocolResult<Option<String>> {
        let path = format!("/program/{program}/head?max_len={max_len}");
        let Some(response) = self.get(&path).await? else {
            return Ok(None);
        };
        let text = response.text().await.map_err(classify)?;
        Ok(Some(text.chars().take(max_len).collect()))
    }

    async fn read_active_program(&mut self) -> ProtocolResult<ActiveProgram> {
        let program: ActiveProgramResponse = self.require_json("/program/active").await?;
        Ok(ActiveProgram { main: program.main })
    }

    async fn read_time_accumulators(
        &mut self,
        ids: &[u32],
    ) -> ProtocolResult<Option<HashMap<u32, i64>>> {
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let Some(raw) = self
            .get_json::<HashMap<String, i64>>(&format!("/params?ids={joined}"))
            .await?
        else {
            return Ok(None);
        };

        let mut values = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let id = key
                .parse::<u32>()
                .map_err(|_| ProtocolError::Other(format!("invalid parameter id '{key}'")))?;
            values.insert(id, value);
        }
        Ok(Some(values))
    }
}
