//! Beam login dialect: login / solution / job
//!
//! Every reply is a `result` message with a numeric `code` and a `description`.
//! A solution's `id` is the job id it solves and correlates the reply.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::adapter::{Dispatch, ProtocolAdapter};
use super::client::Client;
use super::error::{codes, MessageError, StratumError, StratumErrorKind};
use super::orchestrator::Stratum;
use super::protocol::{normalize_hex, StratumRequest};
use crate::algorithm::difficulty;
use crate::config::Dialect;
use crate::jobs::Job;
use crate::shares::Share;

const SHARE_ACCEPTED: i64 = 1;

pub mod writer {
    use super::*;

    fn result(id: &Value, code: i64, description: &str) -> Map<String, Value> {
        let mut msg = Map::new();
        msg.insert("id".to_string(), id.clone());
        msg.insert("method".to_string(), json!("result"));
        msg.insert("code".to_string(), json!(code));
        msg.insert("description".to_string(), json!(description));
        msg.insert("jsonrpc".to_string(), json!("2.0"));
        msg
    }

    pub fn login_success(id: &Value, nonce_prefix: &str, handshake: &Map<String, Value>) -> Value {
        let mut msg = result(id, 0, "Login success.");
        msg.insert("nonceprefix".to_string(), json!(nonce_prefix));
        for (key, value) in handshake {
            msg.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(msg)
    }

    pub fn login_fail(id: &Value, reason: Option<&str>) -> Value {
        let description = match reason {
            Some(reason) if !reason.is_empty() => format!("Login failed: {}", reason),
            _ => "Login failed.".to_string(),
        };
        Value::Object(result(id, i64::from(codes::OTHER), &description))
    }

    pub fn error(id: &Value, error: &StratumError) -> Value {
        Value::Object(result(id, i64::from(error.code()), error.message()))
    }

    pub fn share_accepted(id: &Value) -> Value {
        Value::Object(result(id, SHARE_ACCEPTED, "accepted"))
    }

    pub fn job(job: &Job, packed_difficulty: u32) -> Value {
        json!({
            "id": job.id(),
            "method": "job",
            "height": job.height(),
            "difficulty": packed_difficulty,
            "input": job.input_hex(),
            "jsonrpc": "2.0",
        })
    }
}

pub struct BeamAdapter {
    multiplier: f64,
}

impl BeamAdapter {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }

    fn handle_login(
        &self,
        stratum: &Arc<Stratum>,
        client: &Arc<Client>,
        request: &StratumRequest,
    ) -> Result<Dispatch, MessageError> {
        if client.is_subscribed() {
            client.disconnect("Login but already logged in");
            return Ok(Dispatch::Handled);
        }

        let api_key = request.field_str("api_key")?.trim().to_string();
        if api_key.is_empty() {
            client.send(&writer::login_fail(&request.id, Some("missing api_key")));
            client.disconnect("Login without api_key");
            return Ok(Dispatch::Handled);
        }
        if let Some(agent) = request.opt_field_str("agent") {
            tracing::debug!("Login from {} using {}", client.peer_addr(), agent);
        }

        client.set_worker_name(api_key);
        stratum.client_subscribed(client);

        let stratum = Arc::clone(stratum);
        let client = Arc::clone(client);
        let id = request.id.clone();
        tokio::spawn(async move {
            let verdict = stratum.authorize_worker(&client).await;
            if client.is_disconnected() {
                return;
            }
            match verdict {
                Err(e) => {
                    tracing::warn!("Authorization error for {}: {}", client.peer_addr(), e);
                    client.send(&writer::login_fail(&id, None));
                    client.disconnect("Error while authorizing");
                }
                Ok(false) => {
                    client.send(&writer::login_fail(&id, Some(StratumErrorKind::UnauthorizedWorker.message())));
                    client.disconnect("Worker not authorized");
                }
                Ok(true) => {
                    let handshake = stratum.upstream().handshake_fields();
                    client.send(&writer::login_success(&id, client.nonce_prefix(), &handshake));
                    stratum.worker_authorized(&client);
                }
            }
        });
        Ok(Dispatch::Handled)
    }

    fn handle_solution(
        &self,
        stratum: &Arc<Stratum>,
        client: &Arc<Client>,
        request: &StratumRequest,
    ) -> Result<Dispatch, MessageError> {
        let job_id = request.id_string().ok_or(MessageError::MissingField("id"))?;
        let nonce = normalize_hex(request.field_str("nonce")?);
        let output = normalize_hex(request.field_str("output")?);

        let mut share = Share::from_client(client, job_id, nonce, output);
        let valid = stratum.validate_share(&mut share);

        let reply = match share.error() {
            Some(kind) if !valid => writer::error(&request.id, &StratumError::from(kind)),
            _ => writer::share_accepted(&request.id),
        };
        client.send(&reply);

        stratum.submit_share(client, share);
        Ok(Dispatch::Handled)
    }
}

impl ProtocolAdapter for BeamAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Beam
    }

    fn handle_message(
        &self,
        stratum: &Arc<Stratum>,
        client: &Arc<Client>,
        request: &StratumRequest,
    ) -> Result<Dispatch, MessageError> {
        let method = request.method.as_str();

        if method == "login" {
            return self.handle_login(stratum, client, request);
        }

        if !client.is_subscribed() {
            client.disconnect("Not logged in");
            return Ok(Dispatch::Handled);
        }

        match method {
            "solution" if client.is_authorized() => {
                client.touch();
                self.handle_solution(stratum, client, request)
            }
            "solution" => {
                let error = StratumError::from(StratumErrorKind::UnauthorizedWorker);
                client.send(&writer::error(&request.id, &error));
                Ok(Dispatch::Handled)
            }
            _ => {
                if !request.id.is_null() {
                    let error = StratumError::custom(format!("Unknown method: {}", method));
                    client.send(&writer::error(&request.id, &error));
                }
                Ok(Dispatch::Unhandled)
            }
        }
    }

    fn push_job(&self, client: &Client, job: &Job, _is_new_block: bool) {
        let packed = difficulty::pack(client.difficulty() * self.multiplier);
        client.send(&writer::job(job, packed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_success_merges_handshake_fields() {
        let mut handshake = Map::new();
        handshake.insert("forkheight".to_string(), json!(321));
        handshake.insert("code".to_string(), json!(99));

        let msg = writer::login_success(&json!("login"), "0a0b0c0d", &handshake);
        assert_eq!(msg["id"], "login");
        assert_eq!(msg["method"], "result");
        assert_eq!(msg["code"], 0);
        assert_eq!(msg["description"], "Login success.");
        assert_eq!(msg["nonceprefix"], "0a0b0c0d");
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["forkheight"], 321);
    }

    #[test]
    fn test_login_fail_descriptions() {
        let with_reason = writer::login_fail(&json!("login"), Some("bad key"));
        assert_eq!(with_reason["code"], -32003);
        assert_eq!(with_reason["description"], "Login failed: bad key");

        let bare = writer::login_fail(&json!("login"), None);
        assert_eq!(bare["description"], "Login failed.");
    }

    #[test]
    fn test_share_replies() {
        assert_eq!(
            writer::share_accepted(&json!("7")),
            json!({"id": "7", "method": "result", "code": 1, "description": "accepted", "jsonrpc": "2.0"})
        );

        let err = writer::error(&json!("7"), &StratumError::from(StratumErrorKind::DuplicateShare));
        assert_eq!(err["code"], -32006);
        assert_eq!(err["description"], "Duplicate share");
    }
}
