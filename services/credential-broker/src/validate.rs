//! Request validation
//!
//! Each operation has a fixed payload schema. Validation runs before the
//! rate limiter and before any handler: a failure yields exactly one
//! `INVALID_REQUEST` naming the offending field, and no store or provider is
//! touched. Payload fields not in the schema are ignored.

use provider::OAuthToken;
use serde_json::{Map, Value};

use crate::protocol::Failure;

/// Upper bound for a provider or bucket name.
pub const MAX_NAME_LEN: usize = 64;
/// Upper bound for an API key name.
pub const MAX_KEY_NAME_LEN: usize = 128;
/// Upper bound for a request id or session id.
pub const MAX_ID_LEN: usize = 128;
/// Upper bound for an authorization code.
pub const MAX_CODE_LEN: usize = 4096;
/// Upper bound for a serialized token in `save_token`.
pub const MAX_TOKEN_BYTES: usize = 64 * 1024;

/// `(provider, bucket)` addressed by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub provider: String,
    pub bucket: String,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetToken(BucketRef),
    SaveToken { target: BucketRef, token: OAuthToken },
    RemoveToken(BucketRef),
    ListProviders,
    ListBuckets { provider: String },
    GetBucketStats(BucketRef),
    GetApiKey { name: String },
    ListApiKeys,
    HasApiKey { name: String },
    OAuthInitiate(BucketRef),
    OAuthExchange { session_id: String, code: String },
    OAuthPoll { session_id: String },
    OAuthCancel { session_id: String },
    RefreshToken(BucketRef),
}

impl Request {
    /// Wire name of the operation.
    pub fn op(&self) -> &'static str {
        match self {
            Request::GetToken(_) => "get_token",
            Request::SaveToken { .. } => "save_token",
            Request::RemoveToken(_) => "remove_token",
            Request::ListProviders => "list_providers",
            Request::ListBuckets { .. } => "list_buckets",
            Request::GetBucketStats(_) => "get_bucket_stats",
            Request::GetApiKey { .. } => "get_api_key",
            Request::ListApiKeys => "list_api_keys",
            Request::HasApiKey { .. } => "has_api_key",
            Request::OAuthInitiate(_) => "oauth_initiate",
            Request::OAuthExchange { .. } => "oauth_exchange",
            Request::OAuthPoll { .. } => "oauth_poll",
            Request::OAuthCancel { .. } => "oauth_cancel",
            Request::RefreshToken(_) => "refresh_token",
        }
    }

    /// Provider and bucket named by the request, for allowlist checks.
    pub fn target(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Request::GetToken(t)
            | Request::SaveToken { target: t, .. }
            | Request::RemoveToken(t)
            | Request::GetBucketStats(t)
            | Request::OAuthInitiate(t)
            | Request::RefreshToken(t) => (Some(t.provider.as_str()), Some(t.bucket.as_str())),
            Request::ListBuckets { provider } => (Some(provider.as_str()), None),
            _ => (None, None),
        }
    }
}

/// A decodable frame that failed validation. `id` is echoed when it was valid.
#[derive(Debug)]
pub struct Rejected {
    pub id: Value,
    pub failure: Failure,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    /// Provider or bucket name.
    Name,
    /// API key name.
    KeyName,
    /// Opaque string with a length bound.
    Text { max: usize },
    /// Token object for `save_token`.
    Token,
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    required: bool,
    rule: Rule,
}

const fn field(name: &'static str, required: bool, rule: Rule) -> Field {
    Field {
        name,
        required,
        rule,
    }
}

const PROVIDER: Field = field("provider", true, Rule::Name);
const BUCKET: Field = field("bucket", false, Rule::Name);
const KEY_NAME: Field = field("name", true, Rule::KeyName);
const SESSION_ID: Field = field("session_id", true, Rule::Text { max: MAX_ID_LEN });
const CODE: Field = field("code", true, Rule::Text { max: MAX_CODE_LEN });
const TOKEN: Field = field("token", true, Rule::Token);

/// Operation → payload schema.
const SCHEMAS: &[(&str, &[Field])] = &[
    ("get_token", &[PROVIDER, BUCKET]),
    ("save_token", &[PROVIDER, BUCKET, TOKEN]),
    ("remove_token", &[PROVIDER, BUCKET]),
    ("list_providers", &[]),
    ("list_buckets", &[PROVIDER]),
    ("get_bucket_stats", &[PROVIDER, BUCKET]),
    ("get_api_key", &[KEY_NAME]),
    ("list_api_keys", &[]),
    ("has_api_key", &[KEY_NAME]),
    ("oauth_initiate", &[PROVIDER, BUCKET]),
    ("oauth_exchange", &[SESSION_ID, CODE]),
    ("oauth_poll", &[SESSION_ID]),
    ("oauth_cancel", &[SESSION_ID]),
    ("refresh_token", &[PROVIDER, BUCKET]),
];

fn schema(op: &str) -> Option<&'static [Field]> {
    SCHEMAS
        .iter()
        .find(|(name, _)| *name == op)
        .map(|(_, fields)| *fields)
}

/// Provider/bucket names: 1–64 chars of `[A-Za-z0-9._-]`, starting alphanumeric.
pub fn is_valid_name(name: &str) -> bool {
    valid_identifier(name, MAX_NAME_LEN)
}

fn valid_identifier(name: &str, max: usize) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= max
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validate a decoded frame into `(id, Request)`.
pub fn parse_request(mut frame: Map<String, Value>) -> Result<(Value, Request), Rejected> {
    let id = match frame.remove("id") {
        Some(Value::String(s)) if !s.is_empty() && s.len() <= MAX_ID_LEN => Value::String(s),
        Some(Value::Number(n)) if n.is_u64() => Value::Number(n),
        Some(_) => return Err(reject(Value::Null, "id", "id must be a non-empty string or integer")),
        None => return Err(reject(Value::Null, "id", "id is required")),
    };

    let op = match frame.remove("op").or_else(|| frame.remove("operation")) {
        Some(Value::String(op)) => op,
        Some(_) => return Err(reject(id, "op", "op must be a string")),
        None => return Err(reject(id, "op", "op is required")),
    };

    let Some(fields) = schema(&op) else {
        return Err(reject(id, "op", format!("unknown operation: {op}")));
    };

    let mut payload = match frame.remove("payload") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(reject(id, "payload", "payload must be an object")),
    };

    for field in fields {
        if let Err(failure) = check_field(field, payload.get(field.name)) {
            return Err(Rejected { id, failure });
        }
    }

    match build(&op, &mut payload) {
        Ok(request) => Ok((id, request)),
        Err(failure) => Err(Rejected { id, failure }),
    }
}

fn reject(id: Value, field: &str, message: impl AsRef<str>) -> Rejected {
    Rejected {
        id,
        failure: Failure::invalid(field, message),
    }
}

fn check_field(field: &Field, value: Option<&Value>) -> Result<(), Failure> {
    let name = field.name;
    let value = match value {
        None | Some(Value::Null) if field.required => {
            return Err(Failure::invalid(name, format!("{name} is required")));
        }
        None | Some(Value::Null) => return Ok(()),
        Some(v) => v,
    };

    match field.rule {
        Rule::Name => match value.as_str() {
            Some(s) if is_valid_name(s) => Ok(()),
            _ => Err(Failure::invalid(
                name,
                format!(
                    "{name} must be 1-{MAX_NAME_LEN} characters of [A-Za-z0-9._-] starting with a letter or digit"
                ),
            )),
        },
        Rule::KeyName => match value.as_str() {
            Some(s) if valid_identifier(s, MAX_KEY_NAME_LEN) => Ok(()),
            _ => Err(Failure::invalid(
                name,
                format!("{name} must be 1-{MAX_KEY_NAME_LEN} characters of [A-Za-z0-9._-]"),
            )),
        },
        Rule::Text { max } => match value.as_str() {
            Some(s) if !s.is_empty() && s.len() <= max => Ok(()),
            _ => Err(Failure::invalid(
                name,
                format!("{name} must be a string of 1-{max} bytes"),
            )),
        },
        Rule::Token => check_token(value).map_err(|msg| Failure::invalid(name, msg)),
    }
}

fn check_token(value: &Value) -> Result<(), String> {
    let Some(object) = value.as_object() else {
        return Err("token must be an object".into());
    };
    match object.get("access_token").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => {}
        _ => return Err("token.access_token must be a non-empty string".into()),
    }
    let size = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > MAX_TOKEN_BYTES {
        return Err(format!("token must not exceed {MAX_TOKEN_BYTES} bytes"));
    }
    Ok(())
}

fn take_string(payload: &mut Map<String, Value>, name: &str) -> Option<String> {
    match payload.remove(name) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn bucket_ref(payload: &mut Map<String, Value>) -> BucketRef {
    BucketRef {
        provider: take_string(payload, "provider").unwrap_or_default(),
        bucket: take_string(payload, "bucket").unwrap_or_else(|| common::DEFAULT_BUCKET.to_string()),
    }
}

/// Construct the typed request. Fields were checked against the schema.
fn build(op: &str, payload: &mut Map<String, Value>) -> Result<Request, Failure> {
    let string = |payload: &mut Map<String, Value>, name: &str| {
        take_string(payload, name).unwrap_or_default()
    };

    let request = match op {
        "get_token" => Request::GetToken(bucket_ref(payload)),
        "save_token" => {
            let target = bucket_ref(payload);
            let token_value = payload.remove("token").unwrap_or(Value::Null);
            let token: OAuthToken = serde_json::from_value(token_value)
                .map_err(|e| Failure::invalid("token", format!("token is malformed: {e}")))?;
            Request::SaveToken { target, token }
        }
        "remove_token" => Request::RemoveToken(bucket_ref(payload)),
        "list_providers" => Request::ListProviders,
        "list_buckets" => Request::ListBuckets {
            provider: string(payload, "provider"),
        },
        "get_bucket_stats" => Request::GetBucketStats(bucket_ref(payload)),
        "get_api_key" => Request::GetApiKey {
            name: string(payload, "name"),
        },
        "list_api_keys" => Request::ListApiKeys,
        "has_api_key" => Request::HasApiKey {
            name: string(payload, "name"),
        },
        "oauth_initiate" => Request::OAuthInitiate(bucket_ref(payload)),
        "oauth_exchange" => Request::OAuthExchange {
            session_id: string(payload, "session_id"),
            code: string(payload, "code"),
        },
        "oauth_poll" => Request::OAuthPoll {
            session_id: string(payload, "session_id"),
        },
        "oauth_cancel" => Request::OAuthCancel {
            session_id: string(payload, "session_id"),
        },
        "refresh_token" => Request::RefreshToken(bucket_ref(payload)),
        other => return Err(Failure::invalid("op", format!("unknown operation: {other}"))),
    };
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use serde_json::json;

    fn parse(value: Value) -> Result<(Value, Request), Rejected> {
        match value {
            Value::Object(map) => parse_request(map),
            _ => panic!("test frames must be objects"),
        }
    }

    fn rejected_field(value: Value) -> String {
        let rejected = parse(value).unwrap_err();
        assert_eq!(rejected.failure.code, ErrorCode::InvalidRequest);
        rejected.failure.field.unwrap()
    }

    #[test]
    fn valid_names() {
        let longest = "x".repeat(64);
        let too_long = "x".repeat(65);
        for name in ["gemini", "qwen-code", "a", "p1.work_2", longest.as_str()] {
            assert!(is_valid_name(name), "{name}");
        }
        for name in ["", "-lead", ".hidden", "has space", "a/b", "é", too_long.as_str()] {
            assert!(!is_valid_name(name), "{name}");
        }
    }

    #[test]
    fn bucket_defaults_to_default() {
        let (id, request) =
            parse(json!({"id": "1", "op": "get_token", "payload": {"provider": "gemini"}}))
                .unwrap();
        assert_eq!(id, json!("1"));
        assert_eq!(
            request,
            Request::GetToken(BucketRef {
                provider: "gemini".into(),
                bucket: "default".into()
            })
        );
    }

    #[test]
    fn operation_alias_is_accepted() {
        let (_, request) = parse(json!({"id": 4, "operation": "list_providers"})).unwrap();
        assert_eq!(request, Request::ListProviders);
        assert_eq!(request.op(), "list_providers");
    }

    #[test]
    fn missing_or_bad_id_is_rejected_with_null_id() {
        let rejected = parse(json!({"op": "list_providers"})).unwrap_err();
        assert_eq!(rejected.id, Value::Null);
        assert_eq!(rejected.failure.field.as_deref(), Some("id"));

        assert_eq!(rejected_field(json!({"id": true, "op": "list_providers"})), "id");
        assert_eq!(rejected_field(json!({"id": "", "op": "list_providers"})), "id");
        assert_eq!(rejected_field(json!({"id": -1, "op": "list_providers"})), "id");
    }

    #[test]
    fn unknown_op_is_rejected_on_op_field() {
        let rejected = parse(json!({"id": "9", "op": "drop_tables"})).unwrap_err();
        assert_eq!(rejected.id, json!("9"));
        assert_eq!(rejected.failure.field.as_deref(), Some("op"));
        assert_eq!(rejected_field(json!({"id": "9"})), "op");
        assert_eq!(rejected_field(json!({"id": "9", "op": 3})), "op");
    }

    #[test]
    fn payload_must_be_an_object() {
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "list_providers", "payload": [1]})),
            "payload"
        );
        // null payload is treated as empty
        assert!(parse(json!({"id": "1", "op": "list_providers", "payload": null})).is_ok());
    }

    #[test]
    fn required_fields_are_named() {
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "get_token", "payload": {}})),
            "provider"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "oauth_exchange", "payload": {"session_id": "s"}})),
            "code"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "get_api_key", "payload": {}})),
            "name"
        );
    }

    #[test]
    fn charset_and_length_violations_are_named() {
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "get_token", "payload": {"provider": "../etc"}})),
            "provider"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "get_token", "payload": {"provider": "p", "bucket": 5}})),
            "bucket"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "oauth_poll", "payload": {"session_id": "s".repeat(129)}})),
            "session_id"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "oauth_exchange", "payload": {"session_id": "s", "code": ""}})),
            "code"
        );
    }

    #[test]
    fn save_token_requires_access_token() {
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "save_token", "payload": {"provider": "p", "token": "str"}})),
            "token"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "save_token", "payload": {"provider": "p", "token": {"access_token": ""}}})),
            "token"
        );
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "save_token", "payload": {"provider": "p", "token": {"access_token": "a", "expiry": "soon"}}})),
            "token"
        );
    }

    #[test]
    fn save_token_size_is_bounded() {
        let big = "x".repeat(MAX_TOKEN_BYTES);
        assert_eq!(
            rejected_field(json!({"id": "1", "op": "save_token", "payload": {"provider": "p", "token": {"access_token": big}}})),
            "token"
        );
    }

    #[test]
    fn save_token_parses_extensions() {
        let (_, request) = parse(json!({
            "id": "1",
            "op": "save_token",
            "payload": {"provider": "qwen", "bucket": "work", "token": {"access_token": "at", "resource_url": "portal.qwen.ai"}}
        }))
        .unwrap();
        let Request::SaveToken { target, token } = request else {
            panic!("expected SaveToken");
        };
        assert_eq!(target.bucket, "work");
        assert_eq!(token.extra["resource_url"], "portal.qwen.ai");
    }

    #[test]
    fn targets_for_allowlist_checks() {
        let (_, request) = parse(json!({"id": "1", "op": "list_buckets", "payload": {"provider": "p"}})).unwrap();
        assert_eq!(request.target(), (Some("p"), None));
        let (_, request) = parse(json!({"id": "1", "op": "oauth_poll", "payload": {"session_id": "s"}})).unwrap();
        assert_eq!(request.target(), (None, None));
    }
}
