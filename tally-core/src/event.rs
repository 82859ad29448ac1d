//! Retail event model and the payload decoder.
//!
//! The decoder performs structural validation only: required fields must be
//! present and coercible. Business values (negative quantities, zero prices)
//! pass through untouched.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Order,
    Return,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ORDER" => Some(EventKind::Order),
            "RETURN" => Some(EventKind::Return),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    #[serde(rename = "SKU", default)]
    pub sku: String,
    #[serde(default)]
    pub title: String,
    pub unit_price: f64,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetailEvent {
    pub invoice_no: i64,
    pub country: String,
    pub event_time: DateTime<Utc>,
    pub kind: EventKind,
    pub items: Vec<LineItem>,
}

/// Per-invoice metrics, one per accepted `RetailEvent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedInvoice {
    pub invoice_no: i64,
    pub country: String,
    #[serde(rename = "timestamp")]
    pub event_time: DateTime<Utc>,
    pub total_cost: f64,
    pub total_items: i64,
    pub is_order: u8,
    pub is_return: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type {0:?}")]
    UnknownKind(String),
    /// Unparseable, or too close to the ends of the time range to window.
    #[error("invalid timestamp {0}")]
    Timestamp(String),
}

#[derive(Deserialize)]
struct WireEvent {
    invoice_no: i64,
    country: String,
    timestamp: serde_json::Value,
    #[serde(rename = "type")]
    kind: String,
    items: Vec<LineItem>,
}

/// Decode one raw payload into a `RetailEvent`.
pub fn decode_event(payload: &[u8]) -> Result<RetailEvent, DecodeError> {
    let wire: WireEvent = serde_json::from_slice(payload)?;
    let kind = EventKind::parse(&wire.kind).ok_or(DecodeError::UnknownKind(wire.kind))?;
    let event_time = parse_event_time(&wire.timestamp)
        .ok_or_else(|| DecodeError::Timestamp(wire.timestamp.to_string()))?;
    Ok(RetailEvent {
        invoice_no: wire.invoice_no,
        country: wire.country,
        event_time,
        kind,
        items: wire.items,
    })
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` / `YYYY-MM-DDTHH:MM:SS[.f]`
/// (taken as UTC) and integral epoch milliseconds.
pub fn parse_event_time(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    match v {
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        serde_json::Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &[u8] = br#"{"invoice_no":154132541653705,"country":"United Kingdom","timestamp":"2020-09-18 10:55:23","type":"ORDER","items":[{"SKU":"21485","title":"RETROSPOT HEART HOT WATER BOTTLE","unit_price":4.95,"quantity":6},{"SKU":"23499","title":"SET 12 VINTAGE DOILY CHALK","unit_price":0.42,"quantity":2}]}"#;

    #[test]
    fn decodes_order_payload() {
        let ev = decode_event(ORDER).unwrap();
        assert_eq!(ev.invoice_no, 154132541653705);
        assert_eq!(ev.country, "United Kingdom");
        assert_eq!(ev.kind, EventKind::Order);
        assert_eq!(ev.items.len(), 2);
        assert_eq!(ev.items[0].sku, "21485");
        assert_eq!(ev.items[1].quantity, 2);
        assert_eq!(ev.event_time, Utc.with_ymd_and_hms(2020, 9, 18, 10, 55, 23).unwrap());
    }

    #[test]
    fn decoding_twice_yields_equal_events() {
        assert_eq!(decode_event(ORDER).unwrap(), decode_event(ORDER).unwrap());
    }

    #[test]
    fn accepts_rfc3339_and_epoch_millis() {
        let rfc = br#"{"invoice_no":1,"country":"France","timestamp":"2020-09-18T10:55:23+02:00","type":"RETURN","items":[]}"#;
        let ev = decode_event(rfc).unwrap();
        assert_eq!(ev.event_time, Utc.with_ymd_and_hms(2020, 9, 18, 8, 55, 23).unwrap());
        assert_eq!(ev.kind, EventKind::Return);

        let ms = br#"{"invoice_no":1,"country":"France","timestamp":1600426523000,"type":"ORDER","items":[]}"#;
        let ev = decode_event(ms).unwrap();
        assert_eq!(ev.event_time.timestamp_millis(), 1_600_426_523_000);
    }

    #[test]
    fn negative_quantity_passes_through() {
        let p = br#"{"invoice_no":7,"country":"EIRE","timestamp":"2020-09-18 10:00:00","type":"ORDER","items":[{"SKU":"1","title":"x","unit_price":2.0,"quantity":-3}]}"#;
        assert_eq!(decode_event(p).unwrap().items[0].quantity, -3);
    }

    #[test]
    fn rejects_unknown_type() {
        let p = br#"{"invoice_no":1,"country":"Spain","timestamp":"2020-09-18 10:00:00","type":"EXCHANGE","items":[]}"#;
        match decode_event(p) {
            Err(DecodeError::UnknownKind(k)) => assert_eq!(k, "EXCHANGE"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_fields_and_garbage() {
        assert!(matches!(
            decode_event(br#"{"invoice_no":1,"country":"Spain","type":"ORDER","items":[]}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(decode_event(b"not json"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode_event(br#"{"invoice_no":"abc","country":"Spain","timestamp":"2020-09-18 10:00:00","type":"ORDER","items":[]}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let p = br#"{"invoice_no":1,"country":"Spain","timestamp":"yesterday","type":"ORDER","items":[]}"#;
        assert!(matches!(decode_event(p), Err(DecodeError::Timestamp(_))));
    }

    #[test]
    fn enriched_invoice_serializes_timestamp_field() {
        let inv = EnrichedInvoice {
            invoice_no: 3,
            country: "Norway".into(),
            event_time: Utc.with_ymd_and_hms(2020, 9, 18, 10, 0, 0).unwrap(),
            total_cost: -12.5,
            total_items: 4,
            is_order: 0,
            is_return: 1,
        };
        let v = serde_json::to_value(&inv).unwrap();
        assert_eq!(v["timestamp"], serde_json::json!("2020-09-18T10:00:00Z"));
        assert_eq!(v["is_return"], serde_json::json!(1));
        assert!(v.get("event_time").is_none());
    }
}
