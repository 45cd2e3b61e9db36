//! # Validation
//!
//! Input checks that run before any business logic touches storage.
//!
//! The rule of thumb: anything a client can get wrong over the wire is
//! caught here with a typed error; storage-layer code may then assume
//! structurally valid input and only enforce transactional invariants.

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::OrderLine;
use crate::{MAX_LINE_QUANTITY, MAX_ORDER_LINES, PLACEHOLDER_PREFIX};

// =============================================================================
// Product Identifiers
// =============================================================================

/// Parses a wire product id into a genuine server-assigned id.
///
/// Offline clients carry `temp-…` placeholders until the catalog syncs;
/// those must never reach a committed sale or a stock movement.
pub fn parse_product_id(value: &str) -> Result<i64, ValidationError> {
    if value.is_empty() || value.starts_with(PLACEHOLDER_PREFIX) {
        return Err(ValidationError::InvalidProductId {
            value: value.to_string(),
        });
    }
    value
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ValidationError::InvalidProductId {
            value: value.to_string(),
        })
}

// =============================================================================
// Order Lines
// =============================================================================

/// Validates a single order line's structural fields.
pub fn validate_line(line: &OrderLine) -> CoreResult<()> {
    if line.line_id.is_empty() {
        return Err(ValidationError::Required {
            field: "line_id".to_string(),
        }
        .into());
    }
    if line.name.is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        }
        .into());
    }
    if line.quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        }
        .into());
    }
    if line.quantity > MAX_LINE_QUANTITY {
        return Err(CoreError::QuantityTooLarge {
            requested: line.quantity,
            max: MAX_LINE_QUANTITY,
        });
    }
    if line.unit_price.is_negative() {
        return Err(ValidationError::MustBePositive {
            field: "unit_price".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validates a whole item list for an active-order upsert.
///
/// An empty list is legal here (it means "clear the table"); size and
/// per-line checks apply to whatever lines are present.
pub fn validate_order_lines(lines: &[OrderLine]) -> CoreResult<()> {
    if lines.len() > MAX_ORDER_LINES {
        return Err(CoreError::OrderTooLarge {
            max: MAX_ORDER_LINES,
        });
    }
    for line in lines {
        validate_line(line)?;
    }
    Ok(())
}

/// Validates the selection of a partial transfer.
///
/// The ids must resolve against the source order's lines; a selection
/// naming only unknown lines would silently move nothing.
pub fn validate_transfer_selection(
    source_lines: &[OrderLine],
    selected_ids: &[String],
) -> CoreResult<()> {
    if source_lines.is_empty() {
        return Err(ValidationError::NoItemsSelected.into());
    }
    if selected_ids.is_empty() {
        // Whole-order transfer.
        return Ok(());
    }
    let any_match = source_lines
        .iter()
        .any(|l| selected_ids.iter().any(|id| *id == l.line_id));
    if !any_match {
        return Err(ValidationError::NoItemsSelected.into());
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;

    fn line(qty: i64) -> OrderLine {
        OrderLine::new("42", "Espresso", Money::from_cents(250), qty)
    }

    #[test]
    fn test_parse_product_id_accepts_numeric() {
        assert_eq!(parse_product_id("42").unwrap(), 42);
    }

    #[test]
    fn test_parse_product_id_rejects_placeholders() {
        assert!(parse_product_id("").is_err());
        assert!(parse_product_id("temp-17").is_err());
        assert!(parse_product_id("abc").is_err());
        assert!(parse_product_id("0").is_err());
        assert!(parse_product_id("-5").is_err());
    }

    #[test]
    fn test_validate_line() {
        assert!(validate_line(&line(3)).is_ok());
        assert!(validate_line(&line(0)).is_err());
        assert!(validate_line(&line(-1)).is_err());
        assert!(matches!(
            validate_line(&line(MAX_LINE_QUANTITY + 1)),
            Err(CoreError::QuantityTooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_order_lines_size_cap() {
        let lines: Vec<OrderLine> = (0..=MAX_ORDER_LINES).map(|_| line(1)).collect();
        assert!(matches!(
            validate_order_lines(&lines),
            Err(CoreError::OrderTooLarge { .. })
        ));
        assert!(validate_order_lines(&[]).is_ok());
    }

    #[test]
    fn test_transfer_selection() {
        let source = vec![line(1), line(2)];
        let known = vec![source[0].line_id.clone()];
        let unknown = vec!["nope".to_string()];

        assert!(validate_transfer_selection(&source, &known).is_ok());
        assert!(validate_transfer_selection(&source, &[]).is_ok());
        assert!(validate_transfer_selection(&source, &unknown).is_err());
        assert!(validate_transfer_selection(&[], &known).is_err());
    }
}
