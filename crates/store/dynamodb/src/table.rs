use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, KeySchemaElement, KeyType, ProvisionedThroughput, ScalarAttributeType,
};

/// Partition key attribute. `name` is a DynamoDB reserved word, so every
/// expression that mentions it must bind it through an expression
/// attribute name.
pub(crate) const ATTR_NAME: &str = "name";

/// Holding client identity; empty string when ownership has been cleared.
pub(crate) const ATTR_OWNER: &str = "owner";

/// Monotonic CAS witness.
pub(crate) const ATTR_VERSION: &str = "version";

/// Advertised lease length in milliseconds.
pub(crate) const ATTR_DURATION_MS: &str = "duration_ms";

/// Optional application payload (binary).
pub(crate) const ATTR_PAYLOAD: &str = "payload";

/// Create the `DynamoDB` lock table programmatically.
///
/// The table uses a single `name` (String) hash key. This is intended for
/// tests and local development; in production you would typically provision
/// the table via Infrastructure-as-Code tooling.
///
/// # Errors
///
/// Returns an error if the `CreateTable` call fails for reasons other than
/// the table already existing.
pub async fn create_table(
    client: &Client,
    table_name: &str,
) -> Result<(), aws_sdk_dynamodb::Error> {
    let result = client
        .create_table()
        .table_name(table_name)
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name(ATTR_NAME)
                .key_type(KeyType::Hash)
                .build()
                .expect("valid key schema"),
        )
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name(ATTR_NAME)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .expect("valid attribute definition"),
        )
        .provisioned_throughput(
            ProvisionedThroughput::builder()
                .read_capacity_units(5)
                .write_capacity_units(5)
                .build()
                .expect("valid throughput"),
        )
        .send()
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) => {
            // Tolerate "table already exists" so `create_table` is idempotent.
            let service_err = err.into_service_error();
            if service_err.is_resource_in_use_exception() {
                Ok(())
            } else {
                Err(service_err.into())
            }
        }
    }
}
