/// Stratum message types and field access
///
/// Both dialects share the outer shape `{id, method, params?, ...}`. The login
/// dialect carries its arguments as top-level fields, kept in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::MessageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// JSON-RPC version (usually "2.0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID, doubles as job id for login-dialect solutions
    #[serde(default)]
    pub id: Value,

    /// Method name
    pub method: String,

    /// Positional parameters (classic dialect)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Named top-level fields (login dialect)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StratumRequest {
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn has_numeric_id(&self) -> bool {
        self.id.is_number()
    }

    /// Id rendered as a plain string, numbers included.
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn params_array(&self) -> Result<&Vec<Value>, MessageError> {
        match &self.params {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(MessageError::ParamsNotArray),
        }
    }

    /// Required string at `index` of the positional params.
    pub fn param_str(&self, index: usize, name: &'static str) -> Result<&str, MessageError> {
        match self.params_array()?.get(index) {
            None | Some(Value::Null) => Err(MessageError::MissingField(name)),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(MessageError::WrongType(name)),
        }
    }

    /// Normalized hex at `index`; missing or non-string values read as "".
    pub fn param_hex(&self, index: usize) -> Result<String, MessageError> {
        Ok(self.params_array()?
            .get(index)
            .and_then(Value::as_str)
            .map(normalize_hex)
            .unwrap_or_default())
    }

    /// Required top-level string field.
    pub fn field_str(&self, name: &'static str) -> Result<&str, MessageError> {
        match self.extra.get(name) {
            None | Some(Value::Null) => Err(MessageError::MissingField(name)),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(MessageError::WrongType(name)),
        }
    }

    pub fn opt_field_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

/// Hex as miners send it: optional `0x`, any case.
pub fn normalize_hex(value: &str) -> String {
    let trimmed = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    trimmed.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classic_request() {
        let req = StratumRequest::parse(
            r#"{"id":4,"method":"mining.submit","params":["w1","2","00000001",null,"0xABCD"]}"#,
        )
        .unwrap();

        assert!(req.has_numeric_id());
        assert_eq!(req.id_string().as_deref(), Some("4"));
        assert_eq!(req.param_str(0, "workerName").unwrap(), "w1");
        assert_eq!(req.param_hex(3).unwrap(), "");
        assert_eq!(req.param_hex(4).unwrap(), "abcd");
        assert_eq!(req.param_hex(9).unwrap(), "");
        assert!(matches!(req.param_str(7, "output"), Err(MessageError::MissingField("output"))));
    }

    #[test]
    fn test_parse_login_request() {
        let req = StratumRequest::parse(
            r#"{"id":"login","method":"login","api_key":"key","agent":"lolMiner","jsonrpc":"2.0"}"#,
        )
        .unwrap();

        assert!(!req.has_numeric_id());
        assert_eq!(req.field_str("api_key").unwrap(), "key");
        assert_eq!(req.opt_field_str("agent"), Some("lolMiner"));
        assert!(matches!(req.params_array(), Err(MessageError::ParamsNotArray)));
        assert!(matches!(req.param_hex(1), Err(MessageError::ParamsNotArray)));
    }

    #[test]
    fn test_wrong_types() {
        let req = StratumRequest::parse(r#"{"id":1,"method":"solution","nonce":5,"params":[1]}"#).unwrap();
        assert!(matches!(req.field_str("nonce"), Err(MessageError::WrongType("nonce"))));
        assert!(matches!(req.param_str(0, "workerName"), Err(MessageError::WrongType("workerName"))));
        assert_eq!(req.param_hex(0).unwrap(), "");
        assert!(matches!(req.field_str("output"), Err(MessageError::MissingField("output"))));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(StratumRequest::parse("{not json"), Err(MessageError::Json(_))));
        assert!(StratumRequest::parse(r#"{"id":1}"#).is_err());
    }
}
