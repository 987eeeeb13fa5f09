//! Full store copy from the master into an empty store directory.

use crate::broker::Master;
use crate::identity::{MachineId, StoreId};
use crate::protocol::{FileStoreWriter, SlaveContext, StoreWriter};
use crate::receiver::apply_streams;
use crate::storage::GraphFactory;
use crate::util::HaError;
use log::info;
use std::fs;
use std::io;
use std::path::Path;

/// Streams the master's store into `store_dir`, then replays the
/// transactions committed while the copy was in flight.
///
/// The logical log version is bumped past every copied history file so new
/// logs never overwrite them.
pub fn copy_store_from_master(
    master: &dyn Master,
    machine_id: MachineId,
    store_dir: &Path,
    factory: &dyn GraphFactory,
) -> Result<StoreId, HaError> {
    fs::create_dir_all(store_dir)?;
    let mut writer = FileStoreWriter::new(store_dir);
    let response = master.copy_store(&SlaveContext::anonymous(machine_id), &mut writer)?;
    writer.done()?;
    info!(
        "event=store_copied store_dir={} files={} store_id={}",
        store_dir.display(),
        writer.written().len(),
        response.store_id()
    );

    if let Some(version) = highest_log_version(store_dir, factory.logical_log_name())? {
        factory.set_log_version(store_dir, version + 1)?;
    }

    let copy = factory.open_for_copy(store_dir)?;
    let applied = apply_streams(&*copy, response.streams());
    let stopped = copy.shutdown();
    let applied = applied?;
    stopped?;
    info!("event=store_copy_replayed transactions={applied}");
    Ok(response.store_id())
}

/// Highest `<log_name>.v<N>` history version present in `store_dir`.
pub fn highest_log_version(store_dir: &Path, log_name: &str) -> io::Result<Option<u64>> {
    let prefix = format!("{log_name}.v");
    let mut highest = None;
    for entry in fs::read_dir(store_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(version) = name
            .to_str()
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|suffix| suffix.parse::<u64>().ok())
        else {
            continue;
        };
        highest = highest.max(Some(version));
    }
    Ok(highest)
}
