//! Finalized window results as written to the two KPI streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::Record;

use crate::table::WindowAccumulator;
use crate::window::{Window, WindowKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<Window> for WindowSpan {
    fn from(w: Window) -> Self {
        Self {
            start: w.start,
            end: w.end,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalKpi {
    pub window: WindowSpan,
    #[serde(rename = "OPM")]
    pub opm: u64,
    pub total_sale_volume: f64,
    /// `None` for a window without invoices.
    pub average_transaction_size: Option<f64>,
    pub rate_of_return: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryKpi {
    pub window: WindowSpan,
    pub country: String,
    #[serde(rename = "OPM")]
    pub opm: u64,
    pub total_sale_volume: f64,
    pub rate_of_return: Option<f64>,
}

fn per_invoice(sum: f64, count: u64) -> Option<f64> {
    (count > 0).then(|| sum / count as f64)
}

impl GlobalKpi {
    pub fn finalize(window: Window, acc: &WindowAccumulator) -> Self {
        Self {
            window: window.into(),
            opm: acc.count,
            total_sale_volume: acc.sum_cost,
            average_transaction_size: per_invoice(acc.sum_cost, acc.count),
            rate_of_return: per_invoice(acc.sum_is_return, acc.count),
        }
    }
}

impl CountryKpi {
    pub fn finalize(window: Window, country: impl Into<String>, acc: &WindowAccumulator) -> Self {
        Self {
            window: window.into(),
            country: country.into(),
            opm: acc.count,
            total_sale_volume: acc.sum_cost,
            rate_of_return: per_invoice(acc.sum_is_return, acc.count),
        }
    }
}

/// Build the sink record for a drained key: global keys produce a
/// `GlobalKpi`, grouped keys a `CountryKpi`.
pub fn to_record(key: &WindowKey, acc: &WindowAccumulator) -> tally_core::Result<Record> {
    let value = match &key.group {
        None => serde_json::to_value(GlobalKpi::finalize(key.window, acc))?,
        Some(country) => {
            serde_json::to_value(CountryKpi::finalize(key.window, country.as_str(), acc))?
        }
    };
    Ok(Record::keyed(key.sink_key(), key.window.end, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window {
            start: Utc.with_ymd_and_hms(2020, 9, 18, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2020, 9, 18, 0, 1, 0).unwrap(),
        }
    }

    #[test]
    fn global_kpi_divides_by_count() {
        let acc = WindowAccumulator {
            count: 2,
            sum_cost: 30.0,
            sum_is_return: 0.0,
        };
        let kpi = GlobalKpi::finalize(window(), &acc);
        assert_eq!(kpi.opm, 2);
        assert_eq!(kpi.average_transaction_size, Some(15.0));
        assert_eq!(kpi.rate_of_return, Some(0.0));
    }

    #[test]
    fn empty_window_has_null_ratios() {
        let kpi = GlobalKpi::finalize(window(), &WindowAccumulator::default());
        assert_eq!(kpi.opm, 0);
        assert_eq!(kpi.total_sale_volume, 0.0);
        let v = serde_json::to_value(&kpi).unwrap();
        assert!(v["average_transaction_size"].is_null());
        assert!(v["rate_of_return"].is_null());
    }

    #[test]
    fn records_carry_window_identity() {
        let acc = WindowAccumulator {
            count: 1,
            sum_cost: -5.0,
            sum_is_return: 1.0,
        };
        let rec = to_record(&WindowKey::grouped(window(), "France"), &acc).unwrap();
        assert_eq!(
            rec.key.as_deref(),
            Some("2020-09-18T00:00:00.000Z/2020-09-18T00:01:00.000Z/France")
        );
        assert_eq!(rec.value["OPM"], serde_json::json!(1));
        assert_eq!(rec.value["country"], serde_json::json!("France"));
        assert_eq!(rec.value["rate_of_return"], serde_json::json!(1.0));
        assert_eq!(rec.value["window"]["start"], serde_json::json!("2020-09-18T00:00:00Z"));
        assert!(rec.value.get("average_transaction_size").is_none());
    }
}
