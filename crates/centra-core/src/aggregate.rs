// ── Derived aggregate fields ──
//
// Some canonical fields are computed from several independently pushed
// sub-values. The policy for missing sub-components lives here, fixed,
// instead of being inferred per call site.

use std::collections::BTreeMap;

use crate::model::{DeviceKind, FieldValue};

/// Phase readings feeding the meter power total.
pub(crate) const METER_PHASE_FIELDS: [&str; 3] =
    ["power_phase_1", "power_phase_2", "power_phase_3"];

/// Canonical name of the derived meter power total.
pub(crate) const METER_TOTAL_FIELD: &str = "power_total";

/// Recompute derived fields after any sub-component change.
///
/// Policy: a sub-component that has never been reported counts as zero
/// until its first value arrives.
pub(crate) fn recompute(kind: DeviceKind, fields: &mut BTreeMap<String, FieldValue>) {
    if kind == DeviceKind::Meter {
        let total: f64 = METER_PHASE_FIELDS
            .iter()
            .map(|name| {
                fields
                    .get(*name)
                    .and_then(FieldValue::as_number)
                    .unwrap_or(0.0)
            })
            .sum();
        fields.insert(METER_TOTAL_FIELD.to_owned(), FieldValue::Number(total));
    }
}
