use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, WarehouseResult};

/// Fires after the staging table is loaded and before the dedup merge runs.
pub const LOAD_TABLE_BEFORE_DEDUP: &str = "load_table.before_dedup";

pub fn warehouse_fail_point(name: &str) -> WarehouseResult<()> {
    fail_point!(name, |_| {
        bail!(
            ErrorKind::InjectedFault,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
