use crate::{errors::MessagingError, message::Message};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Display;

#[cfg(any(test, feature = "mocks"))]
use mockall::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Closed,
    Open,
    /// The last open attempt failed or the connection was lost.
    Broken,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Broken => write!(f, "broken"),
        }
    }
}

/// A caller supplied filter of the generic entity contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFilter {
    pub field_name: String,
    pub operator: String,
    pub value: String,
}

impl AppFilter {
    pub fn new<F, O, V>(field_name: F, operator: O, value: V) -> Self
    where
        F: Into<String>,
        O: Into<String>,
        V: Into<String>,
    {
        AppFilter {
            field_name: field_name.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }
}

/// Point in time snapshot of an entity, never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeFlag {
    Ok,
    Warning,
    Failed,
}

/// Structured result for operations that may be unsupported by a data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub flag: OutcomeFlag,
    pub message: String,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        OperationOutcome {
            flag: OutcomeFlag::Ok,
            message: String::new(),
        }
    }

    pub fn warning<T: Into<String>>(message: T) -> Self {
        OperationOutcome {
            flag: OutcomeFlag::Warning,
            message: message.into(),
        }
    }

    pub fn failed<T: Into<String>>(message: T) -> Self {
        OperationOutcome {
            flag: OutcomeFlag::Failed,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.flag == OutcomeFlag::Ok
    }
}

/// Entity oriented access to a data source, one entity per queue for brokers.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn open_connection(&self) -> Result<ConnectionState, MessagingError>;

    async fn close_connection(&self) -> Result<ConnectionState, MessagingError>;

    async fn connection_state(&self) -> ConnectionState;

    async fn entities(&self) -> Result<Vec<String>, MessagingError>;

    async fn entity_exists(&self, name: &str) -> Result<bool, MessagingError>;

    async fn create_entity(&self, name: &str) -> Result<EntityInfo, MessagingError>;

    async fn get_entity(
        &self,
        name: &str,
        filters: &[AppFilter],
    ) -> Result<Option<Message>, MessagingError>;

    async fn insert_entity(&self, name: &str, payload: &Value) -> Result<(), MessagingError>;

    async fn update_entity(
        &self,
        name: &str,
        payload: &Value,
        filters: &[AppFilter],
    ) -> Result<(), MessagingError>;

    async fn delete_entity(&self, name: &str, filters: &[AppFilter])
        -> Result<(), MessagingError>;

    async fn run_query(&self, query: &str) -> Result<Vec<Message>, MessagingError>;

    async fn begin_transaction(&self) -> OperationOutcome;

    async fn commit(&self) -> OperationOutcome;

    async fn end_transaction(&self) -> OperationOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_build_outcomes() {
        assert!(OperationOutcome::ok().is_ok());

        let warning = OperationOutcome::warning("transactions are not supported");
        assert_eq!(warning.flag, OutcomeFlag::Warning);
        assert!(!warning.is_ok());

        assert_eq!(OperationOutcome::failed("boom").flag, OutcomeFlag::Failed);
    }

    #[test]
    fn should_display_connection_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
        assert_eq!(ConnectionState::Broken.to_string(), "broken");
    }

    #[tokio::test]
    async fn should_mock_data_source() {
        let mut ds = MockDataSource::new();
        ds.expect_delete_entity()
            .returning(|name, _| Err(MessagingError::NotSupported(name.to_owned())));

        let res = ds
            .delete_entity("orders", &[AppFilter::new("id", "=", "1")])
            .await;

        assert_eq!(res, Err(MessagingError::NotSupported("orders".to_owned())));
    }
}
