use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::put_item::builders::PutItemFluentBuilder;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use bytes::Bytes;
use tracing::debug;

use dynamolock_store::{LockItem, LockStore, StoreError, WriteOutcome};

use crate::config::DynamoConfig;
use crate::table::{ATTR_DURATION_MS, ATTR_NAME, ATTR_OWNER, ATTR_PAYLOAD, ATTR_VERSION};

/// DynamoDB-backed implementation of [`LockStore`].
///
/// Uses a single table keyed by the lock `name`. Conditional expressions on
/// the stored `(owner, version)` pair implement the CAS primitives; reads
/// always set `ConsistentRead` because a stale read would let two clients
/// observe the same `(owner, version)` and both believe a takeover landed.
pub struct DynamoLockStore {
    client: Client,
    table_name: String,
}

impl DynamoLockStore {
    /// Create a new `DynamoLockStore` from the provided configuration.
    ///
    /// Credentials come from the standard AWS environment chain; the
    /// region and the optional local-development endpoint come from the
    /// [`DynamoConfig`] fields of the same names.
    pub async fn new(config: &DynamoConfig) -> Result<Self, StoreError> {
        let mut loader =
            aws_config::from_env().region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;
        Ok(Self {
            client: Client::new(&sdk_config),
            table_name: config.table_name.clone(),
        })
    }

    /// Create a new `DynamoLockStore` from an existing `DynamoDB` client.
    ///
    /// Useful for sharing a client with other parts of an application.
    pub fn from_client(client: Client, config: &DynamoConfig) -> Self {
        Self {
            client,
            table_name: config.table_name.clone(),
        }
    }

    /// Build a `PutItem` request carrying all of `item`'s attributes.
    fn put_request(&self, item: &LockItem) -> PutItemFluentBuilder {
        let duration_ms = u64::try_from(item.lease.as_millis()).unwrap_or(u64::MAX);
        let mut put = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(ATTR_NAME, AttributeValue::S(item.name.clone()))
            .item(ATTR_OWNER, AttributeValue::S(item.owner.clone()))
            .item(ATTR_VERSION, AttributeValue::N(item.version.to_string()))
            .item(ATTR_DURATION_MS, AttributeValue::N(duration_ms.to_string()));
        if let Some(payload) = &item.payload {
            put = put.item(ATTR_PAYLOAD, AttributeValue::B(Blob::new(payload.to_vec())));
        }
        put
    }

    /// Turn a failed conditional write into a [`WriteOutcome::Conflict`]
    /// carrying the current item, or classify it as a store error.
    async fn conflict_or_error<E>(
        &self,
        name: &str,
        err: SdkError<E>,
    ) -> Result<WriteOutcome, StoreError>
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        if err.code() == Some("ConditionalCheckFailedException") {
            // Read back so callers can see who holds the lock now.
            let current = self.get(name).await?;
            debug!(name, "conditional write lost to the current item");
            return Ok(WriteOutcome::Conflict { current });
        }
        Err(classify_sdk_error(err))
    }
}

#[async_trait]
impl LockStore for DynamoLockStore {
    async fn get(&self, name: &str) -> Result<Option<LockItem>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_NAME, AttributeValue::S(name.to_owned()))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        match result.item() {
            Some(attrs) => Ok(Some(parse_item(attrs)?)),
            None => Ok(None),
        }
    }

    async fn put_if_absent(&self, item: &LockItem) -> Result<WriteOutcome, StoreError> {
        let result = self
            .put_request(item)
            .condition_expression("attribute_not_exists(#name)")
            .expression_attribute_names("#name", ATTR_NAME)
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Ok),
            Err(err) => self.conflict_or_error(&item.name, err).await,
        }
    }

    async fn put_if_matches(
        &self,
        expected_owner: &str,
        expected_version: u64,
        item: &LockItem,
    ) -> Result<WriteOutcome, StoreError> {
        let result = self
            .put_request(item)
            .condition_expression("#owner = :owner AND #version = :version")
            .expression_attribute_names("#owner", ATTR_OWNER)
            .expression_attribute_names("#version", ATTR_VERSION)
            .expression_attribute_values(":owner", AttributeValue::S(expected_owner.to_owned()))
            .expression_attribute_values(
                ":version",
                AttributeValue::N(expected_version.to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Ok),
            Err(err) => self.conflict_or_error(&item.name, err).await,
        }
    }

    async fn delete_if_matches(
        &self,
        name: &str,
        expected_owner: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(ATTR_NAME, AttributeValue::S(name.to_owned()))
            .condition_expression("#owner = :owner AND #version = :version")
            .expression_attribute_names("#owner", ATTR_OWNER)
            .expression_attribute_names("#version", ATTR_VERSION)
            .expression_attribute_values(":owner", AttributeValue::S(expected_owner.to_owned()))
            .expression_attribute_values(
                ":version",
                AttributeValue::N(expected_version.to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Ok),
            Err(err) => self.conflict_or_error(name, err).await,
        }
    }
}

/// Decode a stored item into a [`LockItem`].
fn parse_item(attrs: &HashMap<String, AttributeValue>) -> Result<LockItem, StoreError> {
    let name = match attrs.get(ATTR_NAME) {
        Some(AttributeValue::S(s)) => s.clone(),
        _ => return Err(StoreError::Fatal("item missing name attribute".to_owned())),
    };
    // A missing owner attribute reads the same as a cleared one.
    let owner = match attrs.get(ATTR_OWNER) {
        Some(AttributeValue::S(s)) => s.clone(),
        _ => String::new(),
    };
    let version = match attrs.get(ATTR_VERSION) {
        Some(AttributeValue::N(n)) => n
            .parse::<u64>()
            .map_err(|e| StoreError::Fatal(format!("malformed version attribute: {e}")))?,
        _ => {
            return Err(StoreError::Fatal(
                "item missing version attribute".to_owned(),
            ));
        }
    };
    let duration_ms = match attrs.get(ATTR_DURATION_MS) {
        Some(AttributeValue::N(n)) => n
            .parse::<u64>()
            .map_err(|e| StoreError::Fatal(format!("malformed duration_ms attribute: {e}")))?,
        _ => {
            return Err(StoreError::Fatal(
                "item missing duration_ms attribute".to_owned(),
            ));
        }
    };
    let payload = match attrs.get(ATTR_PAYLOAD) {
        Some(AttributeValue::B(blob)) => Some(Bytes::copy_from_slice(blob.as_ref())),
        _ => None,
    };

    Ok(LockItem {
        name,
        owner,
        version,
        lease: Duration::from_millis(duration_ms),
        payload,
    })
}

/// Service error codes worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionConflictException",
];

/// Split an SDK failure into transient (retryable) and fatal.
fn classify_sdk_error<E>(err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &err {
        // Transport-level failures never reached the service.
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(service) => classify_service_error(service.err()),
        _ => StoreError::Fatal(DisplayErrorContext(&err).to_string()),
    }
}

fn classify_service_error<E>(err: &E) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let message = DisplayErrorContext(err).to_string();
    match err.code() {
        Some(code) if TRANSIENT_CODES.contains(&code) => StoreError::Transient(message),
        _ => StoreError::Fatal(message),
    }
}
