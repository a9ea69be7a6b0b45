use fltport_transport::{FilterInfo, FilterManager};
use tracing::info;

use crate::cmd::{native_manager, FiltersArgs, LifecycleArgs};
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::{print_filters, OutputFormat};

pub fn list(_args: FiltersArgs, format: OutputFormat) -> CliResult<i32> {
    let manager = native_manager()?;
    let filters = enumerate(manager.as_ref())?;
    print_filters(&filters, format);
    Ok(SUCCESS)
}

pub fn load(args: LifecycleArgs) -> CliResult<i32> {
    let manager = native_manager()?;
    load_with(manager.as_ref(), &args.name)?;
    Ok(SUCCESS)
}

pub fn unload(args: LifecycleArgs) -> CliResult<i32> {
    let manager = native_manager()?;
    unload_with(manager.as_ref(), &args.name)?;
    Ok(SUCCESS)
}

/// Installed extensions sorted by altitude, highest first.
fn enumerate(manager: &dyn FilterManager) -> CliResult<Vec<FilterInfo>> {
    let mut filters = manager
        .enumerate()
        .map_err(|err| transport_error("failed listing filters", err))?;
    filters.sort_by(|a, b| {
        altitude_key(&b.altitude)
            .cmp(&altitude_key(&a.altitude))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(filters)
}

// Altitudes are decimal strings, possibly fractional ("385100.5").
fn altitude_key(altitude: &str) -> (u64, u64) {
    let mut parts = altitude.splitn(2, '.');
    let whole = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let frac = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (whole, frac)
}

fn load_with(manager: &dyn FilterManager, name: &str) -> CliResult<()> {
    manager
        .load(name)
        .map_err(|err| transport_error(&format!("failed loading {name}"), err))?;
    info!(filter = name, "extension loaded");
    Ok(())
}

fn unload_with(manager: &dyn FilterManager, name: &str) -> CliResult<()> {
    manager
        .unload(name)
        .map_err(|err| transport_error(&format!("failed unloading {name}"), err))?;
    info!(filter = name, "extension unloaded");
    Ok(())
}
