use super::{StoreError, TableBackend};
use crate::aws::{regional_endpoint, AwsError, AwsJsonClient, CredentialsProvider, JsonProtocol};
use async_trait::async_trait;
use serde_json::{json, Map, Number, Value};
use std::sync::Arc;

pub const DEFAULT_PRIMARY_KEY: &str = "SessionId";
const HISTORY_ATTRIBUTE: &str = "History";

/// History table in DynamoDB, one item per conversation.
pub struct DynamoDbTable {
    client: AwsJsonClient,
    table_name: String,
    primary_key: String,
}

impl DynamoDbTable {
    pub fn new(credentials: Arc<CredentialsProvider>, region: &str, table_name: &str) -> Self {
        Self::with_endpoint(
            credentials,
            region,
            regional_endpoint("dynamodb", region),
            table_name,
            DEFAULT_PRIMARY_KEY,
        )
    }

    pub fn with_endpoint(
        credentials: Arc<CredentialsProvider>,
        region: &str,
        endpoint: impl Into<String>,
        table_name: &str,
        primary_key: &str,
    ) -> Self {
        Self {
            client: AwsJsonClient::new(
                credentials,
                endpoint,
                region,
                "dynamodb",
                "DynamoDB_20120810",
                JsonProtocol::V1_0,
            ),
            table_name: table_name.to_string(),
            primary_key: primary_key.to_string(),
        }
    }

    fn key(&self, key: &str) -> Value {
        json!({ self.primary_key.as_str(): { "S": key } })
    }

    fn map_error(&self, err: AwsError) -> StoreError {
        match err.code() {
            Some("ResourceNotFoundException") => {
                StoreError::NotFound(format!("table {}", self.table_name))
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[async_trait]
impl TableBackend for DynamoDbTable {
    fn name(&self) -> &str {
        "dynamodb"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<Value>>, StoreError> {
        let resp = self
            .client
            .call(
                "GetItem",
                &json!({
                    "TableName": self.table_name,
                    "Key": self.key(key),
                    "ConsistentRead": true,
                }),
            )
            .await
            .map_err(|e| self.map_error(e))?;

        let Some(item) = resp.get("Item") else {
            return Ok(None);
        };
        match item.get(HISTORY_ATTRIBUTE) {
            Some(history) => match from_attribute(history)? {
                Value::Array(entries) => Ok(Some(entries)),
                other => Err(StoreError::Codec(format!(
                    "History attribute is not a list: {other}"
                ))),
            },
            None => Ok(Some(Vec::new())),
        }
    }

    async fn put(&self, key: &str, history: Vec<Value>) -> Result<(), StoreError> {
        let mut item = Map::new();
        item.insert(self.primary_key.clone(), json!({ "S": key }));
        item.insert(
            HISTORY_ATTRIBUTE.to_string(),
            to_attribute(&Value::Array(history)),
        );
        self.client
            .call(
                "PutItem",
                &json!({ "TableName": self.table_name, "Item": item }),
            )
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }

    async fn append(&self, key: &str, entries: Vec<Value>) -> Result<(), StoreError> {
        self.client
            .call(
                "UpdateItem",
                &json!({
                    "TableName": self.table_name,
                    "Key": self.key(key),
                    "UpdateExpression": "SET #h = list_append(if_not_exists(#h, :empty), :entries)",
                    "ExpressionAttributeNames": { "#h": HISTORY_ATTRIBUTE },
                    "ExpressionAttributeValues": {
                        ":empty": { "L": [] },
                        ":entries": to_attribute(&Value::Array(entries)),
                    },
                }),
            )
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .call(
                "DeleteItem",
                &json!({ "TableName": self.table_name, "Key": self.key(key) }),
            )
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(())
    }
}

/// JSON value to DynamoDB attribute value.
pub fn to_attribute(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "NULL": true }),
        Value::Bool(b) => json!({ "BOOL": b }),
        Value::Number(n) => json!({ "N": n.to_string() }),
        Value::String(s) => json!({ "S": s }),
        Value::Array(items) => json!({ "L": items.iter().map(to_attribute).collect::<Vec<_>>() }),
        Value::Object(map) => {
            let converted: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), to_attribute(v)))
                .collect();
            json!({ "M": converted })
        }
    }
}

/// DynamoDB attribute value back to plain JSON. Binary values stay base64.
pub fn from_attribute(attr: &Value) -> Result<Value, StoreError> {
    let Some((kind, inner)) = attr.as_object().and_then(|m| m.iter().next()) else {
        return Err(StoreError::Codec(format!("not an attribute value: {attr}")));
    };
    let bad = || StoreError::Codec(format!("malformed {kind} attribute: {inner}"));
    Ok(match kind.as_str() {
        "NULL" => Value::Null,
        "BOOL" => Value::Bool(inner.as_bool().ok_or_else(bad)?),
        "S" | "B" => Value::String(inner.as_str().ok_or_else(bad)?.to_string()),
        "N" => Value::Number(parse_number(inner.as_str().ok_or_else(bad)?).ok_or_else(bad)?),
        "L" => Value::Array(
            inner
                .as_array()
                .ok_or_else(bad)?
                .iter()
                .map(from_attribute)
                .collect::<Result<_, _>>()?,
        ),
        "M" => Value::Object(
            inner
                .as_object()
                .ok_or_else(bad)?
                .iter()
                .map(|(k, v)| Ok((k.clone(), from_attribute(v)?)))
                .collect::<Result<_, StoreError>>()?,
        ),
        "SS" | "BS" => inner.clone(),
        "NS" => Value::Array(
            inner
                .as_array()
                .ok_or_else(bad)?
                .iter()
                .map(|n| {
                    n.as_str()
                        .and_then(parse_number)
                        .map(Value::Number)
                        .ok_or_else(bad)
                })
                .collect::<Result<_, _>>()?,
        ),
        other => return Err(StoreError::Codec(format!("unknown attribute type {other}"))),
    })
}

fn parse_number(raw: &str) -> Option<Number> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Number::from(i));
    }
    if let Ok(u) = raw.parse::<u64>() {
        return Some(Number::from(u));
    }
    raw.parse::<f64>().ok().and_then(Number::from_f64)
}
