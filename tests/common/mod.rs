#![allow(dead_code)]

use base64::{Engine, prelude::BASE64_STANDARD};
use kostal_interval::{
    auth::scram::{self, HandshakeKeys},
    error::{Error, Result},
    http_client::{Method, Request, Response, Transport},
    schedule::{self, ScheduleCodec},
    settings::Settings,
};
use serde_json::{Value, json};
use std::{cell::RefCell, rc::Rc, time::Duration};

pub const PASSWORD: &str = "inverter-secret";
const SALT: &[u8] = b"kostal-salt-0001";
const ROUNDS: u32 = 1000;
const TRANSACTION_ID: &str = "tx-7";
const TOKEN: &str = "opaque-device-token";
const SESSION_ID: &str = "sid-1";

/// Quarter-hour slots in Europe/Berlin, matching the fake device
pub fn codec() -> ScheduleCodec {
    ScheduleCodec::new(chrono_tz::Europe::Berlin, Duration::from_secs(15 * 60))
        .expect("should create codec")
}

#[derive(Default)]
struct DeviceState {
    settings: Settings,
    calls: Vec<(Method, String)>,
    auth_message: Option<String>,
    tamper_signature: bool,
    logged_out: bool,
}

/// In-memory inverter running the device side of the login handshake
#[derive(Clone)]
pub struct FakeDevice {
    state: Rc<RefCell<DeviceState>>,
}

impl FakeDevice {
    /// Every weekday uniformly set to `digit`
    pub fn new(digit: char) -> Self {
        let settings = schedule::time_control_keys()
            .into_iter()
            .map(|key| (key, digit.to_string().repeat(96)))
            .chain([("Battery:MinSoc".to_string(), "15".to_string())])
            .collect();

        Self {
            state: Rc::new(RefCell::new(DeviceState {
                settings,
                ..Default::default()
            })),
        }
    }

    pub fn tamper_signature(&self) {
        self.state.borrow_mut().tamper_signature = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .borrow()
            .calls
            .iter()
            .map(|(method, path)| format!("{method} {path}"))
            .collect()
    }

    pub fn settings_calls(&self) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|(_, path)| path == "/settings")
            .count()
    }

    pub fn logged_out(&self) -> bool {
        self.state.borrow().logged_out
    }

    pub fn day(&self, weekday: chrono::Weekday) -> String {
        self.state.borrow().settings[&schedule::setting_key_for(weekday)].clone()
    }

    fn keys() -> HandshakeKeys {
        HandshakeKeys::derive(PASSWORD, SALT, ROUNDS).expect("device derives keys")
    }

    fn start(&self, body: &Value) -> Response {
        let (Some("user"), Some(client_nonce)) = (body["username"].as_str(), body["nonce"].as_str())
        else {
            return Response::new(400, r#"{"message":"bad request"}"#);
        };

        let server_nonce = format!("{client_nonce}srv");
        let salt = BASE64_STANDARD.encode(SALT);
        self.state.borrow_mut().auth_message = Some(scram::auth_message(
            "user",
            client_nonce,
            &server_nonce,
            &salt,
            ROUNDS,
        ));

        json_response(json!({
            "nonce": server_nonce,
            "transactionId": TRANSACTION_ID,
            "rounds": ROUNDS,
            "salt": salt,
        }))
    }

    fn finish(&self, body: &Value) -> Response {
        let Some(auth_message) = self.state.borrow().auth_message.clone() else {
            return Response::new(400, "");
        };
        let Some(proof) = body["proof"]
            .as_str()
            .and_then(|p| BASE64_STANDARD.decode(p).ok())
            .and_then(|p| <[u8; scram::KEY_LEN]>::try_from(p).ok())
        else {
            return Response::new(400, "");
        };

        let keys = Self::keys();
        let client_signature = scram::hmac_sha256(keys.stored_key(), &[auth_message.as_bytes()])
            .expect("device computes signature");
        if body["transactionId"] != TRANSACTION_ID
            || &scram::xor(&proof, &client_signature) != keys.client_key()
        {
            return Response::new(400, r#"{"message":"authentication failed"}"#);
        }

        let mut signature = keys
            .server_signature(&auth_message)
            .expect("device computes signature");
        if self.state.borrow().tamper_signature {
            signature[0] ^= 0xff;
        }

        json_response(json!({
            "token": TOKEN,
            "signature": BASE64_STANDARD.encode(signature),
        }))
    }

    fn create_session(&self, body: &Value) -> Response {
        let Some(auth_message) = self.state.borrow().auth_message.clone() else {
            return Response::new(400, "");
        };
        let field = |name: &str| {
            body[name]
                .as_str()
                .and_then(|v| BASE64_STANDARD.decode(v).ok())
                .unwrap_or_default()
        };

        let session_key = Self::keys()
            .session_key(&auth_message)
            .expect("device derives session key");
        match scram::decrypt_token(&session_key, &field("iv"), &field("payload"), &field("tag")) {
            Ok(token) if token == TOKEN => json_response(json!({ "sessionId": SESSION_ID })),
            _ => Response::new(400, r#"{"message":"invalid token"}"#),
        }
    }

    fn read_settings(&self, body: &Value) -> Response {
        let state = self.state.borrow();
        let ids = body[0]["settingids"].as_array().cloned().unwrap_or_default();
        let settings: Vec<Value> = ids
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|id| {
                state
                    .settings
                    .get(id)
                    .map(|value| json!({ "id": id, "value": value }))
            })
            .collect();

        json_response(json!([{ "moduleid": "devices:local", "settings": settings }]))
    }

    fn write_settings(&self, body: &Value) -> Response {
        let updates: Vec<(String, String)> = body[0]["settings"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|s| Some((s["id"].as_str()?.to_string(), s["value"].as_str()?.to_string())))
            .collect();

        let mut state = self.state.borrow_mut();
        if updates.iter().any(|(id, _)| !state.settings.contains_key(id)) {
            return Response::new(400, r#"{"message":"unknown setting"}"#);
        }
        state.settings.extend(updates);
        Response::new(200, "")
    }
}

fn json_response(body: Value) -> Response {
    Response::new(200, body.to_string())
}

impl Transport for FakeDevice {
    fn send(&self, request: Request) -> Result<Response> {
        self.state
            .borrow_mut()
            .calls
            .push((request.method, request.path.clone()));

        let body = request.body.unwrap_or(Value::Null);
        let authorized = request.session_id.as_deref() == Some(SESSION_ID);

        let response = match (request.method, request.path.as_str()) {
            (Method::Post, "/auth/start") => self.start(&body),
            (Method::Post, "/auth/finish") => self.finish(&body),
            (Method::Post, "/auth/create_session") => self.create_session(&body),
            (Method::Get, "/auth/me") => json_response(json!({ "authenticated": authorized })),
            (_, _) if !authorized => Response::new(401, ""),
            (Method::Post, "/auth/logout") => {
                self.state.borrow_mut().logged_out = true;
                Response::new(200, "")
            }
            (Method::Post, "/settings") => self.read_settings(&body),
            (Method::Put, "/settings") => self.write_settings(&body),
            (method, path) => {
                return Err(Error::transport(format!("unexpected {method} {path}")));
            }
        };

        Ok(response)
    }
}
