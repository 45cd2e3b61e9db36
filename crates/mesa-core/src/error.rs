//! # Error Types
//!
//! Domain-specific error types for mesa-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  mesa-core errors (this file)                                           │
//! │  ├── CoreError        - Business rule violations                        │
//! │  └── ValidationError  - Input validation failures                       │
//! │                                                                         │
//! │  mesa-db errors                                                         │
//! │  └── DbError          - Storage failures, conflicts, not-found          │
//! │                                                                         │
//! │  mesa-sync errors                                                       │
//! │  └── SyncError        - Channel, queue and remote-call failures         │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError → caller       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (line id, table id, product id)
//! 3. Errors are enum variants, never String

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Menu item cannot be found.
    ///
    /// ## When This Occurs
    /// - Product id doesn't exist in the catalog
    /// - A sale line references an item deleted since the order was taken
    #[error("Menu item not found: {0}")]
    ItemNotFound(String),

    /// A line item on an order failed the finalization checks.
    ///
    /// Carries the offending line so the caller can point at it; a sale
    /// must never partially commit around a bad line.
    #[error("Invalid line item {line_id}: {reason}")]
    InvalidLineItem { line_id: String, reason: String },

    /// An order exceeded the maximum line count.
    #[error("Order cannot have more than {max} lines")]
    OrderTooLarge { max: usize },

    /// Line quantity exceeds the maximum allowed.
    #[error("Quantity {requested} exceeds maximum allowed ({max})")]
    QuantityTooLarge { requested: i64, max: i64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors, raised before business logic runs.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value must be strictly positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// A product id that is not a genuine server-assigned identifier.
    ///
    /// ## When This Occurs
    /// - An offline placeholder (`temp-…`) leaked into a finalize request
    /// - A corrupted or non-numeric id arrived over the wire
    #[error("'{value}' is not a valid product id")]
    InvalidProductId { value: String },

    /// A partial transfer resolved to zero lines.
    #[error("No lines selected for transfer")]
    NoItemsSelected,

    /// Invalid format (bad UUID, bad JSON payload…).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidLineItem {
            line_id: "a1b2".to_string(),
            reason: "product no longer exists".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid line item a1b2: product no longer exists"
        );
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::NoItemsSelected;
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }

    #[test]
    fn test_invalid_product_id_message() {
        let err = ValidationError::InvalidProductId {
            value: "temp-17".to_string(),
        };
        assert_eq!(err.to_string(), "'temp-17' is not a valid product id");
    }
}
