//! Login handshake and session lifecycle against the device API

use super::{
    Credential,
    scram::{self, HandshakeKeys},
};
use crate::{
    error::{Error, Result},
    http_client::{Request, Response, Transport},
};
use base64::{Engine, prelude::BASE64_STANDARD};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

const AUTH_START: &str = "/auth/start";
const AUTH_FINISH: &str = "/auth/finish";
const AUTH_CREATE_SESSION: &str = "/auth/create_session";
const AUTH_ME: &str = "/auth/me";
const AUTH_LOGOUT: &str = "/auth/logout";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    NonceExchanged,
    ProofSent,
    SessionEstablished,
    Authenticated,
    LoggedOut,
    Failed,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    username: &'a str,
    nonce: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    nonce: String,
    transaction_id: String,
    rounds: u32,
    salt: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishRequest<'a> {
    transaction_id: &'a str,
    proof: String,
}

#[derive(Deserialize)]
struct FinishResponse {
    token: String,
    signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    transaction_id: &'a str,
    iv: String,
    tag: String,
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct MeResponse {
    authenticated: bool,
}

/// One authenticated run against the device
///
/// The remote session is closed when the value is dropped, so every exit
/// path of a run performs a best-effort logout.
pub struct AuthSession<T: Transport> {
    transport: T,
    state: SessionState,
    session_id: Option<String>,
    verify_server_signature: bool,
}

impl<T: Transport> AuthSession<T> {
    pub fn new(transport: T, verify_server_signature: bool) -> Self {
        Self {
            transport,
            state: SessionState::Unauthenticated,
            session_id: None,
            verify_server_signature,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Run the complete handshake
    ///
    /// Any failing step leaves the session in [`SessionState::Failed`];
    /// nothing is retried.
    pub fn login(&mut self, credential: &Credential) -> Result<()> {
        if self.is_authenticated() {
            return Ok(());
        }

        self.handshake(credential).inspect_err(|e| {
            warn!("login failed: {e}");
            self.state = SessionState::Failed;
        })
    }

    fn handshake(&mut self, credential: &Credential) -> Result<()> {
        let client_nonce = scram::client_nonce();
        let start: StartResponse = self
            .post(
                AUTH_START,
                &StartRequest {
                    username: Credential::USERNAME,
                    nonce: &client_nonce,
                },
            )?
            .ensure_success("auth start")?
            .json("auth start")?;
        self.state = SessionState::NonceExchanged;

        let salt = decode("salt", &start.salt)?;
        let keys = HandshakeKeys::derive(credential.password(), &salt, start.rounds)?;
        let auth_message = scram::auth_message(
            Credential::USERNAME,
            &client_nonce,
            &start.nonce,
            &start.salt,
            start.rounds,
        );
        let proof = keys.client_proof(&auth_message)?;

        let res = self.post(
            AUTH_FINISH,
            &FinishRequest {
                transaction_id: &start.transaction_id,
                proof: BASE64_STANDARD.encode(proof),
            },
        )?;
        if res.is_client_error() {
            return Err(Error::authentication(format!(
                "device rejected login proof with status {}",
                res.status
            )));
        }
        let finish: FinishResponse = res.ensure_success("auth finish")?.json("auth finish")?;
        self.state = SessionState::ProofSent;

        if self.verify_server_signature {
            let signature = decode("signature", &finish.signature)?;
            if !keys.verify_server_signature(&auth_message, &signature)? {
                return Err(Error::authentication(
                    "failed to verify device signature: device does not know the password",
                ));
            }
        } else {
            debug!("skipping device signature verification");
        }

        let session_key = keys.session_key(&auth_message)?;
        let iv = scram::random_iv();
        let sealed = scram::encrypt_token(&session_key, &iv, &finish.token)?;

        let created: CreateSessionResponse = self
            .post(
                AUTH_CREATE_SESSION,
                &CreateSessionRequest {
                    transaction_id: &start.transaction_id,
                    iv: BASE64_STANDARD.encode(iv),
                    tag: BASE64_STANDARD.encode(&sealed.tag),
                    payload: BASE64_STANDARD.encode(&sealed.payload),
                },
            )?
            .ensure_success("create session")?
            .json("create session")?;
        self.state = SessionState::SessionEstablished;
        // from here on the remote session exists and must be logged out
        let session_id = self.session_id.insert(created.session_id);

        let me: MeResponse = self
            .transport
            .send(Request::get(AUTH_ME).with_session(session_id))?
            .ensure_success("auth me")?
            .json("auth me")?;

        if !me.authenticated {
            return Err(Error::authentication(
                "device reports the new session as not authenticated",
            ));
        }

        self.state = SessionState::Authenticated;
        info!("logged in to device");
        Ok(())
    }

    fn post(&self, path: &str, body: &impl Serialize) -> Result<Response> {
        let body = serde_json::to_value(body)
            .map_err(|e| Error::protocol(format!("failed to serialize {path} request: {e}")))?;
        self.transport.send(Request::post(path, body))
    }

    /// Send a request carrying the session credential
    pub fn send(&self, request: Request) -> Result<Response> {
        match (&self.session_id, self.state) {
            (Some(session_id), SessionState::Authenticated) => {
                self.transport.send(request.with_session(session_id))
            }
            _ => Err(Error::authentication(format!(
                "failed to send request to {}: no authenticated session",
                request.path
            ))),
        }
    }

    /// Close the remote session
    ///
    /// Failure is only logged; work already done is not rolled back.
    pub fn logout(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };

        match self
            .transport
            .send(Request::post_empty(AUTH_LOGOUT).with_session(&session_id))
            .and_then(|res| res.ensure_success("logout"))
        {
            Ok(_) => info!("logged out from device"),
            Err(e) => warn!("failed to log out from device: {e}"),
        }
        self.state = SessionState::LoggedOut;
    }
}

impl<T: Transport> Drop for AuthSession<T> {
    fn drop(&mut self) {
        self.logout();
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|e| Error::protocol(format!("failed to decode {field}: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http_client::MockTransport;

    pub(crate) fn start_body() -> String {
        // salt is base64 of "0123456789abcdef"
        r#"{"nonce":"c2VydmVybm9uY2U=","transactionId":"tx-1","rounds":1000,"salt":"MDEyMzQ1Njc4OWFiY2RlZg=="}"#
            .to_string()
    }

    /// Expectations for a successful login without signature verification
    pub(crate) fn expect_login(transport: &mut MockTransport) {
        transport
            .expect_send()
            .withf(|r| r.path == AUTH_START)
            .times(1)
            .returning(|_| Ok(Response::new(200, start_body())));
        transport
            .expect_send()
            .withf(|r| r.path == AUTH_FINISH)
            .times(1)
            .returning(|_| Ok(Response::new(200, r#"{"token":"tok","signature":"c2ln"}"#)));
        transport
            .expect_send()
            .withf(|r| r.path == AUTH_CREATE_SESSION)
            .times(1)
            .returning(|_| Ok(Response::new(200, r#"{"sessionId":"s-42"}"#)));
        transport
            .expect_send()
            .withf(|r| r.path == AUTH_ME && r.session_id.as_deref() == Some("s-42"))
            .times(1)
            .returning(|_| Ok(Response::new(200, r#"{"authenticated":true}"#)));
    }

    pub(crate) fn expect_logout(transport: &mut MockTransport) {
        transport
            .expect_send()
            .withf(|r| r.path == AUTH_LOGOUT && r.session_id.as_deref() == Some("s-42"))
            .times(1)
            .returning(|_| Ok(Response::new(200, "")));
    }

    fn credential() -> Credential {
        Credential::new("secret")
    }

    mod login {
        use super::*;

        #[test]
        fn successful_handshake_authenticates_and_logs_out_on_drop() {
            let mut transport = MockTransport::new();
            expect_login(&mut transport);
            expect_logout(&mut transport);

            let mut session = AuthSession::new(transport, false);
            session.login(&credential()).expect("should log in");

            assert_eq!(session.state(), SessionState::Authenticated);
        }

        #[test]
        fn start_request_carries_user_identity_and_nonce() {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|r| {
                    let body = r.body.as_ref().expect("start has a body");
                    r.path == AUTH_START
                        && body["username"] == "user"
                        && body["nonce"].as_str().is_some_and(|n| !n.is_empty())
                })
                .times(1)
                .returning(|_| Ok(Response::new(500, "")));

            let mut session = AuthSession::new(transport, false);
            let err = session.login(&credential()).unwrap_err();

            assert!(matches!(err, Error::Transport(_)));
            assert_eq!(session.state(), SessionState::Failed);
        }

        #[test]
        fn rejected_proof_is_an_authentication_error() {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_START)
                .times(1)
                .returning(|_| Ok(Response::new(200, start_body())));
            transport
                .expect_send()
                .withf(|r| {
                    r.path == AUTH_FINISH
                        && r.body.as_ref().is_some_and(|b| b["transactionId"] == "tx-1")
                })
                .times(1)
                .returning(|_| Ok(Response::new(400, r#"{"message":"bad proof"}"#)));
            transport
                .expect_send()
                .withf(|r| r.path != AUTH_START && r.path != AUTH_FINISH)
                .times(0)
                .returning(|_| Ok(Response::new(200, "")));

            let mut session = AuthSession::new(transport, false);
            let err = session.login(&credential()).unwrap_err();

            assert!(matches!(err, Error::Authentication(_)));
            assert_eq!(session.state(), SessionState::Failed);
        }

        #[test]
        fn missing_start_field_is_a_protocol_error() {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_START)
                .times(1)
                .returning(|_| Ok(Response::new(200, r#"{"nonce":"abc","rounds":10}"#)));

            let mut session = AuthSession::new(transport, false);
            let err = session.login(&credential()).unwrap_err();

            assert!(matches!(err, Error::Protocol(_)));
        }

        #[test]
        fn invalid_server_signature_is_rejected_when_verifying() {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_START)
                .returning(|_| Ok(Response::new(200, start_body())));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_FINISH)
                .returning(|_| Ok(Response::new(200, r#"{"token":"tok","signature":"c2ln"}"#)));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_CREATE_SESSION)
                .times(0)
                .returning(|_| Ok(Response::new(200, "")));

            let mut session = AuthSession::new(transport, true);
            let err = session.login(&credential()).unwrap_err();

            assert!(matches!(err, Error::Authentication(_)));
        }

        #[test]
        fn unauthenticated_me_is_fatal_and_session_is_still_closed() {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_START)
                .returning(|_| Ok(Response::new(200, start_body())));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_FINISH)
                .returning(|_| Ok(Response::new(200, r#"{"token":"tok","signature":"c2ln"}"#)));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_CREATE_SESSION)
                .returning(|_| Ok(Response::new(200, r#"{"sessionId":"s-42"}"#)));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_ME)
                .returning(|_| Ok(Response::new(200, r#"{"authenticated":false}"#)));
            expect_logout(&mut transport);

            let mut session = AuthSession::new(transport, false);
            let err = session.login(&credential()).unwrap_err();

            assert!(matches!(err, Error::Authentication(_)));
            assert!(!session.is_authenticated());
        }

        #[test]
        fn failing_me_request_still_closes_created_session() {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_START)
                .returning(|_| Ok(Response::new(200, start_body())));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_FINISH)
                .returning(|_| Ok(Response::new(200, r#"{"token":"tok","signature":"c2ln"}"#)));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_CREATE_SESSION)
                .returning(|_| Ok(Response::new(200, r#"{"sessionId":"s-42"}"#)));
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_ME)
                .times(1)
                .returning(|_| Err(Error::transport("connection reset")));
            expect_logout(&mut transport);

            let mut session = AuthSession::new(transport, false);
            let err = session.login(&credential()).unwrap_err();

            assert!(matches!(err, Error::Transport(_)));
            assert_eq!(session.state(), SessionState::Failed);
            session.logout();
            assert_eq!(session.state(), SessionState::LoggedOut);
        }
    }

    mod send {
        use super::*;

        #[test]
        fn fails_without_authenticated_session() {
            let transport = MockTransport::new();
            let session = AuthSession::new(transport, false);

            let err = session.send(Request::get("/settings")).unwrap_err();
            assert!(matches!(err, Error::Authentication(_)));
        }

        #[test]
        fn attaches_session_id() {
            let mut transport = MockTransport::new();
            expect_login(&mut transport);
            transport
                .expect_send()
                .withf(|r| r.path == "/settings" && r.session_id.as_deref() == Some("s-42"))
                .times(1)
                .returning(|_| Ok(Response::new(200, "[]")));
            expect_logout(&mut transport);

            let mut session = AuthSession::new(transport, false);
            session.login(&credential()).expect("should log in");

            let res = session.send(Request::get("/settings")).expect("should send");
            assert!(res.is_success());
        }
    }

    mod logout {
        use super::*;

        #[test]
        fn failure_is_not_fatal_and_happens_once() {
            let mut transport = MockTransport::new();
            expect_login(&mut transport);
            transport
                .expect_send()
                .withf(|r| r.path == AUTH_LOGOUT)
                .times(1)
                .returning(|_| Err(Error::transport("connection reset")));

            let mut session = AuthSession::new(transport, false);
            session.login(&credential()).expect("should log in");

            session.logout();
            assert_eq!(session.state(), SessionState::LoggedOut);
            session.logout();
        }

        #[test]
        fn never_established_session_is_not_logged_out() {
            let transport = MockTransport::new();
            let mut session = AuthSession::new(transport, false);

            session.logout();
            assert_eq!(session.state(), SessionState::Unauthenticated);
        }
    }
}
