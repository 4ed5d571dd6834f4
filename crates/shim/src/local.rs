// Local front-end: newline-delimited JSON-RPC 2.0 on stdin/stdout.
//
// Requests are served concurrently; a single writer task owns the output so
// responses and progress notifications never interleave mid-line.

use anyhow::{Context, Result};
use conclave_common::protocol::jsonrpc::{
    self, code_for_kind, Notification, Request, RequestId, Response, RpcError,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::{CallFailure, ShimClient};

/// Serve requests from `reader` until it reaches EOF.
pub async fn serve_stdio<R, W>(reader: R, writer: W, client: ShimClient) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(writer, out_rx));
    let mut in_flight = JoinSet::new();

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("failed to read local request")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Reap finished calls so the set does not grow without bound.
        while in_flight.try_join_next().is_some() {}

        let request = match parse_request(line) {
            Parsed::Request(request) => request,
            Parsed::Notification(method) => {
                debug!(%method, "ignoring local notification");
                continue;
            }
            Parsed::Invalid(response) => {
                send(&out_tx, &response);
                continue;
            }
        };

        let Request { method, params, id, .. } = request;
        match method.as_str() {
            jsonrpc::METHOD_PING => send(&out_tx, &Response::success(id, json!({}))),
            jsonrpc::METHOD_TOOLS_LIST => {
                let client = client.clone();
                let out = out_tx.clone();
                in_flight.spawn(async move {
                    let response = match client.list_tools().await {
                        Ok(payload) => Response::success(id, payload),
                        Err(failure) => Response::error(id, failure_to_rpc(failure)),
                    };
                    send(&out, &response);
                });
            }
            jsonrpc::METHOD_TOOLS_CALL => match call_params(params) {
                Ok((name, arguments)) => {
                    let client = client.clone();
                    let out = out_tx.clone();
                    in_flight.spawn(tools_call(client, out, id, name, arguments));
                }
                Err(message) => send(
                    &out_tx,
                    &Response::error(id, RpcError::new(jsonrpc::INVALID_PARAMS, message)),
                ),
            },
            other => send(
                &out_tx,
                &Response::error(
                    id,
                    RpcError::new(jsonrpc::METHOD_NOT_FOUND, format!("unknown method `{other}`")),
                ),
            ),
        }
    }

    info!(pending = in_flight.len(), "local input closed");
    in_flight.shutdown().await;
    drop(out_tx);
    writer_task.await.context("local writer task panicked")??;
    Ok(())
}

async fn tools_call(
    client: ShimClient,
    out: mpsc::UnboundedSender<String>,
    id: RequestId,
    name: String,
    arguments: Value,
) {
    let progress_id = serde_json::to_value(&id).unwrap_or(Value::Null);
    let progress_out = out.clone();
    let outcome = client
        .call(&name, arguments, move |message| {
            let params = json!({"request_id": progress_id, "message": message});
            send(&progress_out, &Notification::new(jsonrpc::NOTIFICATION_PROGRESS, Some(params)));
        })
        .await;

    let response = match outcome {
        Ok(payload) => Response::success(id, payload),
        Err(failure) => {
            debug!(tool = %name, kind = failure.kind.as_str(), "call failed");
            Response::error(id, failure_to_rpc(failure))
        }
    };
    send(&out, &response);
}

fn failure_to_rpc(failure: CallFailure) -> RpcError {
    let mut data = json!({"kind": failure.kind.as_str()});
    if let Some(partial) = failure.partial {
        data["partial"] = partial;
    }
    RpcError::new(code_for_kind(failure.kind), failure.message).with_data(data)
}

enum Parsed {
    Request(Request),
    Notification(String),
    Invalid(Response),
}

fn parse_request(line: &str) -> Parsed {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(error) => {
            return Parsed::Invalid(Response::error(
                RequestId::Null,
                RpcError::new(jsonrpc::PARSE_ERROR, format!("parse error: {error}")),
            ))
        }
    };

    if value.get("id").is_none() {
        let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
        return Parsed::Notification(method.to_string());
    }

    let id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
        .unwrap_or(RequestId::Null);
    match serde_json::from_value::<Request>(value) {
        Ok(request) if request.jsonrpc == "2.0" => Parsed::Request(request),
        Ok(_) => Parsed::Invalid(Response::error(
            id,
            RpcError::new(jsonrpc::INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        )),
        Err(error) => Parsed::Invalid(Response::error(
            id,
            RpcError::new(jsonrpc::INVALID_REQUEST, format!("invalid request: {error}")),
        )),
    }
}

/// `{name, arguments?}` from `tools/call` params.
fn call_params(params: Option<Value>) -> Result<(String, Value), String> {
    let params = params.ok_or_else(|| "tools/call requires params".to_string())?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| "tools/call requires a string `name`".to_string())?
        .to_string();
    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(arguments @ Value::Object(_)) => arguments.clone(),
        Some(_) => return Err("`arguments` must be an object".to_string()),
    };
    Ok((name, arguments))
}

fn send<T: serde::Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(error) => warn!(%error, "failed to encode local response"),
    }
}

async fn write_lines<W>(mut writer: W, mut lines: mpsc::UnboundedReceiver<String>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        writer.write_all(line.as_bytes()).await.context("failed to write local response")?;
        writer.write_all(b"\n").await.context("failed to write local response")?;
        writer.flush().await.context("failed to flush local output")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_common::protocol::ws::{ClientMessage, HelloReply, ServerMessage};
    use conclave_common::ErrorKind;
    use std::time::Duration;
    use tokio::io::{duplex, BufReader, DuplexStream, Lines};

    use crate::backoff::ReconnectPolicy;
    use crate::connection::{spawn, ConnectionSettings};
    use crate::transport::{DaemonTransport, TransportError};

    /// Daemon stand-in answering every call immediately.
    #[derive(Default)]
    struct EchoDaemon {
        inbound: Option<mpsc::UnboundedReceiver<String>>,
        reply: Option<mpsc::UnboundedSender<String>>,
    }

    impl EchoDaemon {
        fn push(&self, message: impl serde::Serialize) {
            if let Some(reply) = &self.reply {
                let _ = reply.send(serde_json::to_string(&message).unwrap());
            }
        }
    }

    #[async_trait::async_trait]
    impl DaemonTransport for EchoDaemon {
        async fn connect(&mut self, _url: &str) -> Result<(), TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inbound = Some(rx);
            self.reply = Some(tx);
            Ok(())
        }

        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            match serde_json::from_str::<ClientMessage>(&frame).unwrap() {
                ClientMessage::Hello { .. } => self.push(HelloReply::accepted("test", 1.0)),
                ClientMessage::Ping { nonce } => self.push(ServerMessage::Pong { nonce }),
                ClientMessage::CallTool { request_id, tool, params } => {
                    self.push(ServerMessage::Progress {
                        request_id: request_id.clone(),
                        message: "step 1".into(),
                    });
                    if tool == "version" {
                        self.push(ServerMessage::Result { request_id, payload: params });
                    } else {
                        self.push(ServerMessage::Error {
                            request_id: Some(request_id),
                            kind: ErrorKind::UnknownTool,
                            message: format!("unknown tool `{tool}`"),
                            partial: None,
                        });
                    }
                }
                ClientMessage::ListTools { request_id } => self.push(ServerMessage::Result {
                    request_id,
                    payload: json!({"tools": [{"name": "version"}]}),
                }),
                ClientMessage::Cancel { .. } => {}
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, TransportError> {
            let inbound = self.inbound.as_mut().ok_or(TransportError::NotConnected)?;
            Ok(inbound.recv().await)
        }

        async fn close(&mut self) {
            self.inbound = None;
            self.reply = None;
        }
    }

    struct Harness {
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let settings = ConnectionSettings {
                url: "ws://daemon.test/ws".into(),
                session_id: "local-test".into(),
                token: String::new(),
                handshake_timeout: Duration::from_secs(5),
                ping_interval: Duration::from_secs(15),
                reconnect: ReconnectPolicy::default(),
            };
            let client = spawn(EchoDaemon::default(), settings, Duration::from_secs(30));
            let (input, server_in) = duplex(64 * 1024);
            let (server_out, output) = duplex(64 * 1024);
            let server =
                tokio::spawn(serve_stdio(BufReader::new(server_in), server_out, client));
            Self { input, output: BufReader::new(output).lines(), server }
        }

        async fn send(&mut self, line: &str) {
            self.input.write_all(line.as_bytes()).await.unwrap();
            self.input.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                .await
                .expect("timed out waiting for output")
                .unwrap()
                .expect("output closed");
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn ping_is_answered_locally() {
        let mut harness = Harness::start();
        harness.send(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).await;
        assert_eq!(harness.recv().await, json!({"jsonrpc":"2.0","result":{},"id":1}));
    }

    #[tokio::test]
    async fn tools_call_streams_progress_then_result() {
        let mut harness = Harness::start();
        harness
            .send(r#"{"jsonrpc":"2.0","method":"tools/call","id":"c1","params":{"name":"version","arguments":{"x":2}}}"#)
            .await;

        let progress = harness.recv().await;
        assert_eq!(progress["method"], "notifications/progress");
        assert_eq!(progress["params"], json!({"request_id":"c1","message":"step 1"}));

        let response = harness.recv().await;
        assert_eq!(response["id"], "c1");
        assert_eq!(response["result"], json!({"x": 2}));
    }

    #[tokio::test]
    async fn daemon_errors_become_typed_rpc_errors() {
        let mut harness = Harness::start();
        harness
            .send(r#"{"jsonrpc":"2.0","method":"tools/call","id":7,"params":{"name":"nope"}}"#)
            .await;

        let _progress = harness.recv().await;
        let response = harness.recv().await;
        assert_eq!(response["error"]["code"], jsonrpc::UNKNOWN_TOOL);
        assert_eq!(response["error"]["data"], json!({"kind": "UNKNOWN_TOOL"}));
    }

    #[tokio::test]
    async fn protocol_errors_are_reported_and_serving_continues() {
        let mut harness = Harness::start();

        harness.send("{not json").await;
        let response = harness.recv().await;
        assert_eq!(response["error"]["code"], jsonrpc::PARSE_ERROR);
        assert_eq!(response["id"], Value::Null);

        harness.send(r#"{"jsonrpc":"2.0","method":"resources/list","id":2}"#).await;
        assert_eq!(harness.recv().await["error"]["code"], jsonrpc::METHOD_NOT_FOUND);

        harness.send(r#"{"jsonrpc":"2.0","method":"tools/call","id":3,"params":{}}"#).await;
        assert_eq!(harness.recv().await["error"]["code"], jsonrpc::INVALID_PARAMS);

        // Notifications get no reply; the next request is still served.
        harness.send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await;
        harness.send(r#"{"jsonrpc":"2.0","method":"tools/list","id":4}"#).await;
        let listed = harness.recv().await;
        assert_eq!(listed["id"], 4);
        assert_eq!(listed["result"]["tools"][0]["name"], "version");
    }

    #[tokio::test]
    async fn eof_on_input_stops_serving() {
        let harness = Harness::start();
        drop(harness.input);
        let result = tokio::time::timeout(Duration::from_secs(5), harness.server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[test]
    fn call_params_validation() {
        assert_eq!(
            call_params(Some(json!({"name": "analyze"}))).unwrap(),
            ("analyze".to_string(), json!({}))
        );
        assert!(call_params(None).is_err());
        assert!(call_params(Some(json!({"name": ""}))).is_err());
        assert!(call_params(Some(json!({"name": "x", "arguments": [1]}))).is_err());
    }
}
