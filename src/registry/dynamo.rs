//! DynamoDB registry backend.
//!
//! Same logical row as the relational backend: one item per job, `job_id` as
//! the hash key, everything stored as strings.

use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};

use crate::config::DynamoConfig;
use crate::error::RegistryError;

use super::{JobRecord, Registry, parse_timestamp};

pub struct DynamoRegistry {
    client: Client,
    table: String,
}

impl DynamoRegistry {
    /// Credentials and region come from the default AWS provider chain.
    pub async fn connect(config: &DynamoConfig) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            client: Client::new(&sdk_config),
            table: config.table.clone(),
        }
    }

    async fn table_exists(&self) -> Result<bool, RegistryError> {
        match self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_resource_not_found_exception() {
                    Ok(false)
                } else {
                    Err(RegistryError::Backend(service.to_string()))
                }
            }
        }
    }

    /// Wait until the table reaches the wanted existence state. Table
    /// creation and deletion are asynchronous on the DynamoDB side.
    async fn wait_for_table(&self, wanted: bool) -> Result<(), RegistryError> {
        for _ in 0..60 {
            if self.table_exists().await? == wanted {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(RegistryError::Backend(format!(
            "table {} did not become {}",
            self.table,
            if wanted { "available" } else { "absent" }
        )))
    }
}

fn to_item(job: &JobRecord) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("job_id".to_string(), AttributeValue::S(job.id.clone())),
        ("user_id".to_string(), AttributeValue::S(job.user.clone())),
        (
            "start_time".to_string(),
            AttributeValue::S(job.start_time.to_rfc3339()),
        ),
        (
            "end_time".to_string(),
            AttributeValue::S(job.end_time.to_rfc3339()),
        ),
        ("hostname".to_string(), AttributeValue::S(job.host.clone())),
    ])
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<JobRecord, RegistryError> {
    let field = |name: &str| -> Result<&str, RegistryError> {
        item.get(name)
            .and_then(|value| value.as_s().ok())
            .map(String::as_str)
            .ok_or_else(|| RegistryError::Backend(format!("malformed item: missing {name}")))
    };

    Ok(JobRecord {
        id: field("job_id")?.to_string(),
        user: field("user_id")?.to_string(),
        start_time: parse_timestamp(field("start_time")?)?,
        end_time: parse_timestamp(field("end_time")?)?,
        host: field("hostname")?.to_string(),
    })
}

#[async_trait::async_trait]
impl Registry for DynamoRegistry {
    async fn insert(&self, job: &JobRecord) -> Result<(), RegistryError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_item(job)))
            .condition_expression("attribute_not_exists(job_id)")
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    RegistryError::Duplicate { id: job.id.clone() }
                } else {
                    RegistryError::Backend(service.to_string())
                }
            })?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<JobRecord, RegistryError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("job_id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;

        match response.item() {
            Some(item) => from_item(item),
            None => Err(RegistryError::NotFound { id: id.to_string() }),
        }
    }

    async fn list(&self) -> Result<Vec<JobRecord>, RegistryError> {
        let mut jobs = Vec::new();
        let mut start_key = None;

        loop {
            let page = self
                .client
                .scan()
                .table_name(&self.table)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| RegistryError::Backend(e.to_string()))?;

            for item in page.items() {
                jobs.push(from_item(item)?);
            }

            match page.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(jobs)
    }

    async fn update_host(&self, id: &str, host: &str) -> Result<(), RegistryError> {
        self.client
            .update_item()
            .table_name(&self.table)
            .key("job_id", AttributeValue::S(id.to_string()))
            .update_expression("SET #hostname = :hostname")
            .expression_attribute_names("#hostname", "hostname")
            .expression_attribute_values(":hostname", AttributeValue::S(host.to_string()))
            .send()
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("job_id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), RegistryError> {
        if self.table_exists().await? {
            return Ok(());
        }

        let key_attribute = AttributeDefinition::builder()
            .attribute_name("job_id")
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        let key_schema = KeySchemaElement::builder()
            .attribute_name("job_id")
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| RegistryError::Backend(e.to_string()))?;

        self.client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(key_attribute)
            .key_schema(key_schema)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?;

        self.wait_for_table(true).await
    }

    async fn recreate_schema(&self) -> Result<(), RegistryError> {
        if self.table_exists().await? {
            self.client
                .delete_table()
                .table_name(&self.table)
                .send()
                .await
                .map_err(|e| RegistryError::Backend(e.to_string()))?;
            self.wait_for_table(false).await?;
        }
        self.ensure_schema().await
    }
}
