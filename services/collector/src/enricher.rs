use crate::record::PendingRecord;
use crate::sink::MAX_RECORD_BYTES;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;
use woothee::parser::{Parser, WootheeResult};

/// Cookie holding the long-lived client identifier
pub const CLIENT_ID_COOKIE: &str = "__cfje_cid";

/// Cookie holding the session identifier
pub const SESSION_ID_COOKIE: &str = "__cfje_sid";

/// Errors turning an inbound request into a record
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("Event is {size} bytes once enriched, the limit is {limit}")]
    RecordTooLarge { size: usize, limit: usize },
}

/// Tracking event as received, before enrichment
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    /// Event properties sent by the client
    pub body: Map<String, Value>,
    /// User-Agent header
    pub user_agent: Option<String>,
    /// Resolved client address
    pub ip: Option<String>,
    /// Two-letter country code supplied by the CDN edge
    pub country_code: Option<String>,
    /// Value of the client id cookie, if sent
    pub client_cookie: Option<String>,
    /// Value of the session id cookie, if sent
    pub session_cookie: Option<String>,
}

/// Cookie the HTTP layer must set on the response
#[derive(Debug, Clone, PartialEq)]
pub struct SetCookie {
    pub name: &'static str,
    pub value: String,
    pub expires: DateTime<Utc>,
}

impl SetCookie {
    /// Render as a `Set-Cookie` header value
    pub fn header_value(&self) -> String {
        format!(
            "{}={}; Path=/; Expires={}",
            self.name,
            self.value,
            self.expires.format("%a, %d %b %Y %H:%M:%S GMT")
        )
    }
}

/// Result of enriching one event
#[derive(Debug, Clone)]
pub struct Enriched {
    pub record: PendingRecord,
    pub cookies: Vec<SetCookie>,
}

/// Adds identifiers and request-derived attributes to tracking events
#[derive(Debug, Clone)]
pub struct Enricher {
    client_id_ttl: chrono::Duration,
    session_id_ttl: chrono::Duration,
}

impl Default for Enricher {
    fn default() -> Self {
        Self {
            client_id_ttl: chrono::Duration::days(90),
            session_id_ttl: chrono::Duration::hours(30),
        }
    }
}

impl Enricher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrich an event and serialize it as one newline-terminated JSON line
    pub fn enrich(&self, event: RawEvent) -> Result<Enriched, EnrichError> {
        self.enrich_at(event, Utc::now())
    }

    fn enrich_at(&self, event: RawEvent, now: DateTime<Utc>) -> Result<Enriched, EnrichError> {
        let RawEvent {
            mut body,
            user_agent,
            ip,
            country_code,
            client_cookie,
            session_cookie,
        } = event;

        let ua = user_agent.unwrap_or_default();
        let agent = UserAgentInfo::parse(&ua);
        let country_code = country_code.unwrap_or_default();

        body.insert("ip".into(), Value::String(ip.unwrap_or_default()));
        body.insert("device".into(), Value::String(agent.device));
        body.insert("deviceType".into(), Value::String(agent.device_type.into()));
        body.insert("browser".into(), Value::String(agent.browser));
        body.insert("os".into(), Value::String(agent.os));
        body.insert("ua".into(), Value::String(ua));
        body.insert(
            "createdAt".into(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        if let Some(name) = country_name(&country_code) {
            body.insert("country".into(), Value::String(name.to_string()));
        }
        body.insert("countryCode".into(), Value::String(country_code));

        let mut cookies = Vec::new();
        self.assign_id(
            &mut body,
            "clientId",
            client_cookie,
            CLIENT_ID_COOKIE,
            now + self.client_id_ttl,
            &mut cookies,
        );
        self.assign_id(
            &mut body,
            "sessionId",
            session_cookie,
            SESSION_ID_COOKIE,
            now + self.session_id_ttl,
            &mut cookies,
        );

        let record = PendingRecord::from_line(serde_json::to_string(&Value::Object(body))?);
        if record.len() > MAX_RECORD_BYTES {
            return Err(EnrichError::RecordTooLarge {
                size: record.len(),
                limit: MAX_RECORD_BYTES,
            });
        }

        Ok(Enriched { record, cookies })
    }

    /// Keep the id from the body, else reuse the cookie, else mint a new one
    fn assign_id(
        &self,
        body: &mut Map<String, Value>,
        field: &str,
        cookie_value: Option<String>,
        cookie_name: &'static str,
        expires: DateTime<Utc>,
        cookies: &mut Vec<SetCookie>,
    ) {
        let present = body
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|id| !id.is_empty());
        if present {
            return;
        }

        let id = match cookie_value.filter(|value| !value.is_empty()) {
            Some(value) => value,
            None => {
                let value = Uuid::new_v4().to_string();
                cookies.push(SetCookie {
                    name: cookie_name,
                    value: value.clone(),
                    expires,
                });
                value
            }
        };

        body.insert(field.to_string(), Value::String(id));
    }
}

/// Parse a POST body; an empty body counts as an empty object
pub fn parse_body(bytes: &[u8]) -> Result<Map<String, Value>, EnrichError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    match serde_json::from_slice(bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(EnrichError::NotAnObject),
    }
}

/// Turn GET query parameters into event properties.
///
/// Bracketed keys build nested objects (`user[plan]=pro` becomes
/// `{"user":{"plan":"pro"}}`). Numeric and boolean values keep their JSON
/// type, everything else stays a string.
pub fn query_to_body(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut body = Map::new();
    for (key, value) in pairs {
        insert_path(&mut body, &key_path(&key), query_value(value));
    }
    body
}

/// Split `a[b][c]` into its segments; malformed keys are used verbatim
fn key_path(key: &str) -> Vec<&str> {
    let Some(open) = key.find('[').filter(|&open| open > 0) else {
        return vec![key];
    };

    let mut path = vec![&key[..open]];
    let mut rest = &key[open..];
    while let Some(inner) = rest.strip_prefix('[') {
        match inner.find(']') {
            Some(close) if close > 0 => {
                path.push(&inner[..close]);
                rest = &inner[close + 1..];
            }
            _ => return vec![key],
        }
    }

    if rest.is_empty() {
        path
    } else {
        vec![key]
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, tail @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, tail, value);
            }
        }
    }
}

fn query_value(raw: String) -> Value {
    match serde_json::from_str::<Value>(&raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw),
    }
}

/// Common English name for a two-letter country code
pub fn country_name(code: &str) -> Option<&'static str> {
    if code.len() != 2 {
        return None;
    }
    rust_iso3166::from_alpha2(&code.to_ascii_uppercase()).map(|country| country.name)
}

/// Attributes derived from a User-Agent header
#[derive(Debug, Clone, PartialEq)]
pub struct UserAgentInfo {
    /// Device family, `Other` when the agent does not name one
    pub device: String,
    /// One of mobile, tablet, desktop, bot, appliance or unknown
    pub device_type: &'static str,
    /// Browser name and version
    pub browser: String,
    /// Operating system name and version
    pub os: String,
}

const UNKNOWN: &str = "UNKNOWN";
const OTHER: &str = "Other";

impl UserAgentInfo {
    pub fn parse(user_agent: &str) -> Self {
        match Parser::new().parse(user_agent) {
            Some(result) if !user_agent.trim().is_empty() => Self::from_result(user_agent, &result),
            _ => Self {
                device: OTHER.to_string(),
                device_type: "unknown",
                browser: OTHER.to_string(),
                os: OTHER.to_string(),
            },
        }
    }

    fn from_result(user_agent: &str, result: &WootheeResult) -> Self {
        let device = match result.os {
            "iPhone" | "iPad" | "iPod" => result.os.to_string(),
            _ => OTHER.to_string(),
        };

        let device_type = match result.category {
            "pc" => "desktop",
            "crawler" => "bot",
            "mobilephone" => "mobile",
            "appliance" => "appliance",
            "smartphone" if result.os == "iPad" => "tablet",
            // Android tablets omit the "Mobile" token phones carry
            "smartphone" if result.os == "Android" && !user_agent.contains("Mobile") => "tablet",
            "smartphone" => "mobile",
            _ => "unknown",
        };

        Self {
            device,
            device_type,
            browser: with_version(result.name, &result.version.to_string()),
            os: with_version(result.os, &result.os_version.to_string()),
        }
    }
}

fn with_version(name: &str, version: &str) -> String {
    if name.is_empty() || name == UNKNOWN {
        OTHER.to_string()
    } else if version.is_empty() || version == UNKNOWN {
        name.to_string()
    } else {
        format!("{} {}", name, version)
    }
}
