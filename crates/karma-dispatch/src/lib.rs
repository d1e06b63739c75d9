#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use karma_core::{format_rfc3339, DispatchError, NotificationDispatcher, NotificationEvent};
use serde_json::{json, Value};
use tracing::debug;

pub const DEFAULT_RELAY_TIMEOUT_MS: u64 = 5_000;

/// Drops every event. Used when no relay is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcher;

impl NoopDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl NotificationDispatcher for NoopDispatcher {
    fn dispatcher_name(&self) -> &'static str {
        "noop"
    }

    fn delivers(&self) -> bool {
        false
    }

    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        debug!(
            notification_id = %event.notification_id,
            wizard_id = %event.wizard_id,
            "no relay configured, dropping notification"
        );
        Ok(())
    }
}

/// Keeps delivered events in memory and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<NotificationEvent>>,
    fail_with: Option<DispatchError>,
}

impl RecordingDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing(error: DispatchError) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_with: Some(error),
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.guard().clone()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<NotificationEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn dispatcher_name(&self) -> &'static str {
        "recording"
    }

    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.guard().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRelayConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub auth_bearer_token: Option<String>,
}

impl HttpRelayConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_RELAY_TIMEOUT_MS,
            headers: BTreeMap::new(),
            auth_bearer_token: None,
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Reads the bearer token from `env_name`.
    ///
    /// # Errors
    /// Returns [`DispatchError::Configuration`] when the variable is unset.
    pub fn with_token_env(mut self, env_name: &str) -> Result<Self, DispatchError> {
        let token = std::env::var(env_name).map_err(|_| {
            DispatchError::Configuration(format!(
                "missing env var '{env_name}' required for relay authentication"
            ))
        })?;
        self.auth_bearer_token = Some(token);
        Ok(self)
    }

    /// # Errors
    /// Returns [`DispatchError::Configuration`] for non-HTTP URLs or a zero timeout.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(DispatchError::Configuration(format!(
                "relay url must be http(s), got '{}'",
                self.url
            )));
        }
        if self.timeout_ms == 0 {
            return Err(DispatchError::Configuration(
                "relay timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Posts events to a realtime relay as `{channel, event, data}` JSON.
#[derive(Debug)]
pub struct HttpRelayDispatcher {
    config: HttpRelayConfig,
    agent: ureq::Agent,
}

impl HttpRelayDispatcher {
    /// # Errors
    /// Returns [`DispatchError::Configuration`] when the config is invalid.
    pub fn new(config: HttpRelayConfig) -> Result<Self, DispatchError> {
        config.validate()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Ok(Self { config, agent })
    }
}

impl NotificationDispatcher for HttpRelayDispatcher {
    fn dispatcher_name(&self) -> &'static str {
        "http_relay"
    }

    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        let message = relay_message(event)?;

        let mut req = self
            .agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(&message) {
            Ok(response) => {
                debug!(
                    notification_id = %event.notification_id,
                    status = response.status(),
                    "relay accepted notification"
                );
                Ok(())
            }
            Err(ureq::Error::Status(status, response)) => Err(DispatchError::Rejected {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(err)) => Err(DispatchError::Transport(err.to_string())),
        }
    }
}

/// Wire body for one event on the wizard's private channel.
///
/// # Errors
/// Returns [`DispatchError::Configuration`] when the timestamp cannot be formatted.
pub fn relay_message(event: &NotificationEvent) -> Result<Value, DispatchError> {
    let mut data = match &event.payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    data.insert(
        "notification_id".to_string(),
        Value::String(event.notification_id.to_string()),
    );
    data.insert(
        "wizard_id".to_string(),
        Value::String(event.wizard_id.to_string()),
    );
    data.insert(
        "reference_id".to_string(),
        event
            .reference_id
            .clone()
            .map_or(Value::Null, Value::String),
    );
    data.insert(
        "created_at".to_string(),
        Value::String(
            format_rfc3339(event.created_at)
                .map_err(|err| DispatchError::Configuration(err.to_string()))?,
        ),
    );

    Ok(json!({
        "channel": event.wizard_id.private_channel(),
        "event": event.kind.as_str(),
        "data": Value::Object(data),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use karma_core::{NotificationKind, WizardId};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    fn fixture_event() -> NotificationEvent {
        let wizard_id = WizardId::parse("wiz-1").unwrap_or_else(|_| unreachable!());
        NotificationEvent {
            notification_id: ulid::Ulid::new(),
            kind: NotificationKind::KarmaEarned,
            wizard_id,
            reference_id: Some("lost-item-42".to_string()),
            payload: json!({
                "delta": 50,
                "reason": "return_lost_item",
                "karma_score": 60,
                "karma_rank": "D_RANK",
                "previous_rank": "E_RANK",
                "rank_changed": true,
            }),
            created_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn read_request(stream: &mut std::net::TcpStream) -> (String, String) {
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        let mut content_length = 0_usize;
        loop {
            let mut line = String::new();
            let read = reader.read_line(&mut line).unwrap_or(0);
            if read == 0 || line == "\r\n" {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap_or(0);
            }
            head.push_str(&line);
        }
        let mut body = vec![0_u8; content_length];
        if reader.read_exact(&mut body).is_err() {
            body.clear();
        }
        (head, String::from_utf8_lossy(&body).into_owned())
    }

    fn spawn_relay(status_line: &'static str) -> (String, JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|_| unreachable!());
        let addr = listener.local_addr().unwrap_or_else(|_| unreachable!());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap_or_else(|_| unreachable!());
            let request = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope"
            );
            let _ = stream.write_all(response.as_bytes());
            request
        });
        (format!("http://{addr}/events"), handle)
    }

    #[test]
    fn relay_message_targets_private_channel() {
        let event = fixture_event();
        let message = relay_message(&event).unwrap_or_else(|_| unreachable!());
        assert_eq!(message["channel"], "private-user-wiz-1");
        assert_eq!(message["event"], "karma_earned");
        assert_eq!(message["data"]["karma_rank"], "D_RANK");
        assert_eq!(message["data"]["reference_id"], "lost-item-42");
        assert_eq!(message["data"]["created_at"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn noop_dispatcher_accepts_but_does_not_deliver() {
        let noop = NoopDispatcher::new();
        assert!(noop.dispatch(&fixture_event()).is_ok());
        assert!(!noop.delivers());
        assert!(RecordingDispatcher::new().delivers());
    }

    #[test]
    fn recording_dispatcher_keeps_events_or_fails_on_demand() {
        let recorder = RecordingDispatcher::new();
        let event = fixture_event();
        assert!(recorder.dispatch(&event).is_ok());
        assert_eq!(recorder.events(), vec![event.clone()]);

        let failing = RecordingDispatcher::failing(DispatchError::Transport("down".to_string()));
        assert!(matches!(
            failing.dispatch(&event),
            Err(DispatchError::Transport(_))
        ));
        assert!(failing.events().is_empty());
    }

    #[test]
    fn relay_config_rejects_bad_url_and_missing_token_env() {
        assert!(HttpRelayDispatcher::new(HttpRelayConfig::new("ftp://relay")).is_err());
        assert!(
            HttpRelayDispatcher::new(HttpRelayConfig::new("http://relay").with_timeout_ms(0))
                .is_err()
        );
        let missing = HttpRelayConfig::new("http://relay")
            .with_token_env("KARMA_DISPATCH_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert!(matches!(missing, Err(DispatchError::Configuration(_))));
    }

    #[test]
    fn http_relay_posts_event_with_bearer_token() {
        let (url, server) = spawn_relay("200 OK");
        let mut config = HttpRelayConfig::new(url).with_header("x-relay-app", "campus");
        config.auth_bearer_token = Some("secret-token".to_string());
        let dispatcher = HttpRelayDispatcher::new(config).unwrap_or_else(|_| unreachable!());

        let event = fixture_event();
        assert!(dispatcher.dispatch(&event).is_ok());

        let (head, body) = server.join().unwrap_or_else(|_| unreachable!());
        let head = head.to_ascii_lowercase();
        assert!(head.starts_with("post /events"));
        assert!(head.contains("authorization: bearer secret-token"));
        assert!(head.contains("x-relay-app: campus"));

        let sent: Value = serde_json::from_str(&body).unwrap_or_else(|_| unreachable!());
        assert_eq!(sent["channel"], "private-user-wiz-1");
        assert_eq!(sent["data"]["notification_id"], event.notification_id.to_string());
    }

    #[test]
    fn http_relay_maps_error_status_to_rejected() {
        let (url, server) = spawn_relay("503 Service Unavailable");
        let dispatcher =
            HttpRelayDispatcher::new(HttpRelayConfig::new(url)).unwrap_or_else(|_| unreachable!());

        let result = dispatcher.dispatch(&fixture_event());
        let _ = server.join();
        assert_eq!(
            result,
            Err(DispatchError::Rejected {
                status: 503,
                body: "nope".to_string()
            })
        );
    }

    #[test]
    fn http_relay_maps_refused_connection_to_transport() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|_| unreachable!());
            listener.local_addr().unwrap_or_else(|_| unreachable!())
        };
        let dispatcher = HttpRelayDispatcher::new(
            HttpRelayConfig::new(format!("http://{addr}/events")).with_timeout_ms(500),
        )
        .unwrap_or_else(|_| unreachable!());

        assert!(matches!(
            dispatcher.dispatch(&fixture_event()),
            Err(DispatchError::Transport(_))
        ));
    }
}
