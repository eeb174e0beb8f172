// AMQP header table → core Headers

use amqp_bridge_core::domain::Headers;
use lapin::types::{AMQPValue, FieldTable};

/// Convert a delivery's header table, keeping scalar values only
///
/// Nested tables, arrays and byte arrays have no sensible string form and are
/// dropped.
pub fn headers_from_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(name, value)| scalar_to_string(value).map(|v| (name.as_str().to_string(), v)))
        .collect()
}

fn scalar_to_string(value: &AMQPValue) -> Option<String> {
    let s = match value {
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortShortInt(n) => n.to_string(),
        AMQPValue::ShortShortUInt(n) => n.to_string(),
        AMQPValue::ShortInt(n) => n.to_string(),
        AMQPValue::ShortUInt(n) => n.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongUInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        AMQPValue::Float(n) => n.to_string(),
        AMQPValue::Double(n) => n.to_string(),
        AMQPValue::Timestamp(t) => t.to_string(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        _ => return None,
    };
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_bridge_core::domain::{Message, DELIVERY_COUNT_HEADER};
    use lapin::types::{FieldArray, LongString, ShortString};

    #[test]
    fn test_missing_table_is_empty() {
        assert!(headers_from_table(None).is_empty());
    }

    #[test]
    fn test_scalars_are_kept() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("x-trace"), AMQPValue::LongString(LongString::from("abc")));
        table.insert(ShortString::from("x-retry"), AMQPValue::LongInt(3));
        table.insert(ShortString::from("x-flag"), AMQPValue::Boolean(true));
        table.insert(
            ShortString::from("x-list"),
            AMQPValue::FieldArray(FieldArray::default()),
        );

        let headers = headers_from_table(Some(&table));

        assert_eq!(headers.len(), 3);
        assert_eq!(headers["x-trace"], "abc");
        assert_eq!(headers["x-retry"], "3");
        assert_eq!(headers["x-flag"], "true");
    }

    #[test]
    fn test_quorum_delivery_count_is_readable() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(DELIVERY_COUNT_HEADER),
            AMQPValue::LongLongInt(4),
        );

        let message = Message::new(1, "body").with_headers(headers_from_table(Some(&table)));

        assert_eq!(message.delivery_count(), Some(4));
    }
}
