//! Per-invoice metric derivation.

use tally_core::{EnrichedInvoice, EventKind, RetailEvent};

/// Compute the derived fields of one decoded event.
///
/// Total and side-effect free: returns are valued negatively, an empty item
/// list yields zero cost and zero items.
pub fn derive(event: &RetailEvent) -> EnrichedInvoice {
    let gross: f64 = event
        .items
        .iter()
        .map(|i| i.unit_price * f64::from(i.quantity))
        .sum();
    let total_items: i64 = event.items.iter().map(|i| i64::from(i.quantity)).sum();
    let (sign, is_order, is_return) = match event.kind {
        EventKind::Order => (1.0, 1, 0),
        EventKind::Return => (-1.0, 0, 1),
    };
    EnrichedInvoice {
        invoice_no: event.invoice_no,
        country: event.country.clone(),
        event_time: event.event_time,
        total_cost: sign * gross,
        total_items,
        is_order,
        is_return,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tally_core::LineItem;

    fn item(price: f64, qty: i32) -> LineItem {
        LineItem {
            sku: "85123A".into(),
            title: "WHITE HANGING HEART T-LIGHT HOLDER".into(),
            unit_price: price,
            quantity: qty,
        }
    }

    fn event(kind: EventKind, items: Vec<LineItem>) -> RetailEvent {
        RetailEvent {
            invoice_no: 536365,
            country: "United Kingdom".into(),
            event_time: Utc.with_ymd_and_hms(2020, 9, 18, 10, 0, 0).unwrap(),
            kind,
            items,
        }
    }

    #[test]
    fn order_sums_items() {
        let inv = derive(&event(EventKind::Order, vec![item(2.55, 6), item(3.39, 2)]));
        assert!((inv.total_cost - (2.55 * 6.0 + 3.39 * 2.0)).abs() < 1e-9);
        assert_eq!(inv.total_items, 8);
        assert_eq!((inv.is_order, inv.is_return), (1, 0));
        assert_eq!(inv.country, "United Kingdom");
    }

    #[test]
    fn return_cost_is_negated_order_cost() {
        let items = vec![item(1.25, 3), item(0.85, 12), item(4.95, -1)];
        let order = derive(&event(EventKind::Order, items.clone()));
        let ret = derive(&event(EventKind::Return, items));
        assert_eq!(ret.total_cost, -order.total_cost);
        assert_eq!(ret.total_items, order.total_items);
        assert_eq!((ret.is_order, ret.is_return), (0, 1));
    }

    #[test]
    fn empty_order_yields_zeroes() {
        let inv = derive(&event(EventKind::Order, vec![]));
        assert_eq!(inv.total_cost, 0.0);
        assert_eq!(inv.total_items, 0);
        assert_eq!(inv.is_order, 1);
        assert_eq!(inv.is_return, 0);
    }

    #[test]
    fn exactly_one_flag_is_set() {
        for kind in [EventKind::Order, EventKind::Return] {
            let inv = derive(&event(kind, vec![item(1.0, 1)]));
            assert_eq!(inv.is_order + inv.is_return, 1);
        }
    }
}
