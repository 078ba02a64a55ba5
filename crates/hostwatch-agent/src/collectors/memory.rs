// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::json;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use super::CollectResult;
use crate::diagnostics::Diagnostics;

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        ((part as f64 * 1000.0 / total as f64).round()) / 10.0
    }
}

fn refreshed_memory() -> System {
    System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()))
}

/// Physical memory usage, in bytes.
pub fn memory(_: &mut Diagnostics) -> CollectResult {
    let system = refreshed_memory();
    let total = system.total_memory();
    let available = system.available_memory();
    let used = total.saturating_sub(available);
    Ok(json!({
        "total": total,
        "available": available,
        "percent": percent(used, total),
        "used": used,
        "free": system.free_memory(),
    }))
}

/// Swap usage, in bytes.
pub fn swap(_: &mut Diagnostics) -> CollectResult {
    let system = refreshed_memory();
    let total = system.total_swap();
    let used = system.used_swap();
    Ok(json!({
        "total": total,
        "used": used,
        "free": system.free_swap(),
        "percent": percent(used, total),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 3), 33.3);
    }

    #[test]
    fn memory_reports_consistent_totals() {
        let value = memory(&mut Diagnostics::new()).expect("memory is readable");
        let total = value["total"].as_u64().unwrap_or_default();
        let used = value["used"].as_u64().unwrap_or_default();
        assert!(used <= total);
    }
}
