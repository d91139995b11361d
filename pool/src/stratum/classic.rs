//! Classic stratum dialect: mining.subscribe / mining.authorize / mining.submit
//!
//! Replies are `{id, result, error}` with errors as `[code, message, null]`.

use serde_json::{json, Value};
use std::sync::Arc;

use super::adapter::{Dispatch, ProtocolAdapter};
use super::client::Client;
use super::error::{MessageError, StratumError, StratumErrorKind};
use super::orchestrator::Stratum;
use super::protocol::StratumRequest;
use crate::algorithm::difficulty;
use crate::config::Dialect;
use crate::jobs::Job;
use crate::shares::{Share, ShareExtras};

/// Bytes of extranonce2 miners roll.
pub const EXTRANONCE2_SIZE: usize = 4;

/// Wire encoders. Pure, no state.
pub mod writer {
    use super::*;

    pub fn reply(id: &Value, result: Value, error: Option<&StratumError>) -> Value {
        json!({
            "id": id,
            "result": result,
            "error": error.map(StratumError::response_array).unwrap_or(Value::Null),
        })
    }

    pub fn reply_subscribe(id: &Value, subscription_id: &str, nonce_prefix: &str) -> Value {
        reply(
            id,
            json!([[["mining.notify", subscription_id]], nonce_prefix, EXTRANONCE2_SIZE]),
            None,
        )
    }

    pub fn set_difficulty(difficulty: f64) -> Value {
        json!({
            "id": Value::Null,
            "method": "mining.set_difficulty",
            "params": [difficulty],
        })
    }

    pub fn notify(job: &Job, packed_difficulty: u32, clean_jobs: bool) -> Value {
        json!({
            "id": Value::Null,
            "method": "mining.notify",
            "params": [
                job.id(),
                job.height(),
                job.input_hex(),
                format!("{:08x}", packed_difficulty),
                clean_jobs,
            ],
        })
    }
}

pub struct ClassicAdapter {
    multiplier: f64,
}

impl ClassicAdapter {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }

    fn handle_subscribe(&self, stratum: &Arc<Stratum>, client: &Arc<Client>, request: &StratumRequest) -> Dispatch {
        if client.is_subscribed() {
            client.disconnect("Subscribed but already subscribed");
            return Dispatch::Handled;
        }

        stratum.client_subscribed(client);
        client.send(&writer::reply_subscribe(
            &request.id,
            client.subscription_id(),
            client.nonce_prefix(),
        ));
        Dispatch::Handled
    }

    fn handle_authorize(&self, stratum: &Arc<Stratum>, client: &Arc<Client>, request: &StratumRequest) -> Dispatch {
        let worker_name = match request.param_str(0, "workerName") {
            Ok(name) if !name.is_empty() => name.to_string(),
            _ => {
                let error = StratumError::from(StratumErrorKind::UnauthorizedWorker);
                client.send(&writer::reply(&request.id, Value::Null, Some(&error)));
                return Dispatch::Handled;
            }
        };
        client.set_worker_name(worker_name);

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
                    client.disconnect("Error while authorizing");
                }
                Ok(authorized) => {
                    let error = (!authorized).then(|| StratumError::from(StratumErrorKind::UnauthorizedWorker));
                    client.send(&writer::reply(&id, json!(authorized), error.as_ref()));
                    if authorized {
                        stratum.worker_authorized(&client);
                    }
                }
            }
        });
        Dispatch::Handled
    }

    fn handle_submit(
        &self,
        stratum: &Arc<Stratum>,
        client: &Arc<Client>,
        request: &StratumRequest,
    ) -> Result<Dispatch, MessageError> {
        let worker_name = request.param_str(0, "workerName")?;
        if worker_name.is_empty() {
            return Err(MessageError::MissingField("workerName"));
        }
        let job_id = request.param_hex(1)?;
        let extra_nonce2 = Some(request.param_hex(2)?).filter(|v| !v.is_empty());
        let n_time = Some(request.param_hex(3)?).filter(|v| !v.is_empty());
        let nonce = request.param_hex(4)?;
        let output = request.param_hex(5)?;

        let mut share = Share::from_client(client, job_id, nonce, output)
            .with_extras(ShareExtras { extra_nonce2, n_time });
        let valid = stratum.validate_share(&mut share);

        let error = share.error().map(StratumError::from);
        client.send(&writer::reply(&request.id, json!(valid), error.as_ref()));

        stratum.submit_share(client, share);
        Ok(Dispatch::Handled)
    }
}

impl ProtocolAdapter for ClassicAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Classic
    }

    fn handle_message(
        &self,
        stratum: &Arc<Stratum>,
        client: &Arc<Client>,
        request: &StratumRequest,
    ) -> Result<Dispatch, MessageError> {
        let method = request.method.as_str();

        if method == "mining.subscribe" {
            return Ok(self.handle_subscribe(stratum, client, request));
        }

        if !client.is_subscribed() {
            client.disconnect("Not subscribed");
            return Ok(Dispatch::Handled);
        }

        if !client.is_authorized() {
            return Ok(match method {
                "mining.authorize" => self.handle_authorize(stratum, client, request),
                "mining.submit" => {
                    client.disconnect("Share submit but not authorized");
                    Dispatch::Handled
                }
                _ => {
                    if !request.id.is_null() {
                        client.send(&writer::reply(&request.id, json!(false), None));
                    }
                    Dispatch::Unhandled
                }
            });
        }

        match method {
            "mining.extranonce.subscribe" => {
                client.send(&writer::reply(&request.id, json!(false), None));
                Ok(Dispatch::Handled)
            }
            "mining.submit" => {
                client.touch();
                self.handle_submit(stratum, client, request)
            }
            _ => {
                if request.has_numeric_id() {
                    client.send(&writer::reply(&request.id, json!(false), None));
                }
                Ok(Dispatch::Unhandled)
            }
        }
    }

    fn push_job(&self, client: &Client, job: &Job, is_new_block: bool) {
        let diff = client.difficulty();
        client.send(&writer::set_difficulty(diff));
        client.send(&writer::notify(job, difficulty::pack(diff * self.multiplier), is_new_block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamJob;

    #[test]
    fn test_reply_shapes() {
        let ok = writer::reply(&json!(1), json!(true), None);
        assert_eq!(ok, json!({"id": 1, "result": true, "error": null}));

        let err = writer::reply(
            &json!(2),
            json!(false),
            Some(&StratumError::from(StratumErrorKind::StaleShare)),
        );
        assert_eq!(err["error"], json!([-32008, "Stale share - Job not found", null]));
    }

    #[test]
    fn test_subscribe_reply() {
        let reply = writer::reply_subscribe(&json!(1), "deadbeef", "deadbeef");
        assert_eq!(reply["result"], json!([[["mining.notify", "deadbeef"]], "deadbeef", 4]));
        assert!(reply["error"].is_null());
    }

    #[test]
    fn test_notify_encodes_packed_difficulty() {
        let job = Job::new(
            "12".to_string(),
            &UpstreamJob {
                id: "u".to_string(),
                height: 55,
                difficulty: 10.0,
                input: "0xAA".to_string(),
            },
            1.0,
        );
        let msg = writer::notify(&job, difficulty::pack(1024.0), true);
        assert_eq!(msg["method"], "mining.notify");
        assert_eq!(msg["params"], json!(["12", 55, "aa", "0a000000", true]));
    }
}
