//! Request bodies accepted by the gateway routes.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::ConnectParams;
use crate::error::ServerError;
use crate::session::TransactionId;

/// Parse a JSON request body; any syntax or shape error is a validation error.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ServerError> {
    serde_json::from_slice(body).map_err(|err| ServerError::Validation(err.to_string()))
}

/// `/connect` query string.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
}

impl ConnectQuery {
    pub fn into_params(self, default_port: u16) -> Result<ConnectParams, ServerError> {
        let host = non_empty(self.host)
            .ok_or_else(|| ServerError::Validation("missing query parameter: host".to_string()))?;
        let user = non_empty(self.user)
            .ok_or_else(|| ServerError::Validation("missing query parameter: user".to_string()))?;
        Ok(ConnectParams {
            host,
            port: self.port.unwrap_or(default_port),
            user,
            password: self.password,
            dbname: non_empty(self.dbname),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// `transaction_id` as sent by clients: a number, a decimal string, or "".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TransactionIdParam {
    Number(u32),
    Text(String),
}

impl TransactionIdParam {
    pub fn resolve(&self) -> Result<Option<TransactionId>, ServerError> {
        match self {
            TransactionIdParam::Number(id) => Ok(Some(TransactionId::new(*id))),
            TransactionIdParam::Text(text) if text.trim().is_empty() => Ok(None),
            TransactionIdParam::Text(text) => text
                .trim()
                .parse::<u32>()
                .map(|id| Some(TransactionId::new(id)))
                .map_err(|_| ServerError::Validation(format!("invalid transaction_id: {text:?}"))),
        }
    }
}

/// Fields every authenticated request carries. Missing credentials fall
/// through to authentication and fail there.
#[derive(Debug, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub connection_id: u32,
    #[serde(default)]
    pub transaction_id: Option<TransactionIdParam>,
}

impl Envelope {
    pub fn transaction_id(&self) -> Result<Option<TransactionId>, ServerError> {
        match &self.transaction_id {
            Some(param) => param.resolve(),
            None => Ok(None),
        }
    }

    /// The transaction id a commit/rollback must name.
    pub fn required_transaction_id(&self) -> Result<TransactionId, ServerError> {
        self.transaction_id()?
            .ok_or_else(|| ServerError::Validation("missing transaction_id".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub sql: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub sqls: Vec<String>,
    /// One argument list per statement; missing trailing entries mean no arguments.
    #[serde(default)]
    pub args: Vec<Vec<Value>>,
}

impl ExecRequest {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.args.len() > self.sqls.len() {
            return Err(ServerError::Validation(format!(
                "args has {} entries for {} statements",
                self.args.len(),
                self.sqls.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use serde_json::json;

    use super::*;

    #[test]
    fn transaction_id_accepts_numbers_strings_and_empty() -> Result<()> {
        let numeric: Envelope = serde_json::from_value(json!({"transaction_id": 5}))?;
        assert_eq!(numeric.transaction_id().map_err(|e| anyhow!(e.to_string()))?, Some(TransactionId::new(5)));

        let text: Envelope = serde_json::from_value(json!({"transaction_id": "12"}))?;
        assert_eq!(text.transaction_id().map_err(|e| anyhow!(e.to_string()))?, Some(TransactionId::new(12)));

        let empty: Envelope = serde_json::from_value(json!({"transaction_id": ""}))?;
        assert_eq!(empty.transaction_id().map_err(|e| anyhow!(e.to_string()))?, None);

        let null: Envelope = serde_json::from_value(json!({"transaction_id": null}))?;
        assert_eq!(null.transaction_id().map_err(|e| anyhow!(e.to_string()))?, None);

        let garbage: Envelope = serde_json::from_value(json!({"transaction_id": "abc"}))?;
        assert!(matches!(garbage.transaction_id(), Err(ServerError::Validation(_))));
        Ok(())
    }

    #[test]
    fn commit_requires_a_transaction_id() -> Result<()> {
        let envelope: Envelope = serde_json::from_value(json!({"token": "t", "connection_id": 1}))?;
        assert!(matches!(
            envelope.required_transaction_id(),
            Err(ServerError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn missing_credentials_default_to_empty() -> Result<()> {
        let request: QueryRequest = parse_body(br#"{"sql": "SELECT 1"}"#)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(request.envelope.token, "");
        assert_eq!(request.envelope.connection_id, 0);
        assert!(request.args.is_empty());
        Ok(())
    }

    #[test]
    fn flattened_envelope_reads_all_fields() -> Result<()> {
        let request: ExecRequest = parse_body(
            br#"{"token":"abc","connection_id":7,"transaction_id":"3","sqls":["SELECT 1","SELECT $1"],"args":[[],[2]]}"#,
        )
        .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(request.envelope.token, "abc");
        assert_eq!(request.envelope.connection_id, 7);
        assert_eq!(
            request.envelope.transaction_id().map_err(|e| anyhow!(e.to_string()))?,
            Some(TransactionId::new(3))
        );
        assert_eq!(request.args[1], vec![json!(2)]);
        request.validate().map_err(|e| anyhow!(e.to_string()))?;
        Ok(())
    }

    #[test]
    fn malformed_bodies_are_validation_errors() {
        assert!(matches!(
            parse_body::<QueryRequest>(b"{not json"),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            parse_body::<ExecRequest>(br#"{"token":"t","connection_id":1}"#),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            parse_body::<Envelope>(br#"{"connection_id":"seven"}"#),
            Err(ServerError::Validation(_))
        ));
    }

    #[test]
    fn exec_rejects_more_arg_lists_than_statements() -> Result<()> {
        let request: ExecRequest = parse_body(br#"{"sqls":["SELECT 1"],"args":[[],[1]]}"#)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(matches!(request.validate(), Err(ServerError::Validation(_))));
        Ok(())
    }

    #[test]
    fn connect_query_requires_host_and_user() -> Result<()> {
        let params = ConnectQuery {
            host: Some("db".to_string()),
            user: Some("app".to_string()),
            ..ConnectQuery::default()
        }
        .into_params(5432)
        .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(params.port, 5432);
        assert_eq!(params.dbname, None);

        let missing_user = ConnectQuery {
            host: Some("db".to_string()),
            user: Some(String::new()),
            ..ConnectQuery::default()
        };
        assert!(matches!(
            missing_user.into_params(5432),
            Err(ServerError::Validation(_))
        ));
        Ok(())
    }
}
