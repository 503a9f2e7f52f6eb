use super::value_objects::OrderStatus;
use crate::error::EsError;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OrderError {
    #[error("Order is already cancelled")]
    AlreadyCancelled,

    #[error("Order is already confirmed")]
    AlreadyConfirmed,

    #[error("Order already exists")]
    AlreadyCreated,

    #[error("Order is archived")]
    Archived,

    #[error("Order must be confirmed before shipping")]
    NotConfirmed,

    #[error("Order must be shipped before delivery")]
    NotShipped,

    #[error("Cannot modify order in status: {0:?}")]
    InvalidStatusTransition(OrderStatus),

    #[error("Order items cannot be empty")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(i32),

    #[error("Aggregate not initialized")]
    NotInitialized,
}

impl From<OrderError> for EsError {
    fn from(err: OrderError) -> Self {
        EsError::CommandRejected(err.to_string())
    }
}
