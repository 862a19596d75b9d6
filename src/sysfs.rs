//! Sysfs attribute files

use std::{
    error::Error,
    fmt,
    fs::{self, File},
    io::Read as _,
    os::linux::fs::MetadataExt as _,
    path::{Path, PathBuf},
    str::{self, FromStr},
};

use anyhow::Context as _;
use nix::sys::stat;

/// Ensure path is a valid sysfs file path, and normalizes it
pub(crate) fn ensure_sysfs_file(path: &Path) -> anyhow::Result<PathBuf> {
    let path = path.canonicalize()?;
    // Tests fake attributes with FIFOs
    let is_attr = path.is_file()
        || (cfg!(test)
            && path.exists()
            && (path.metadata()?.st_mode() & stat::SFlag::S_IFIFO.bits()) != 0);
    anyhow::ensure!(is_attr, "{path:?} missing or not a file");
    Ok(path)
}

/// Ensure path is a valid sysfs dir path, and normalizes it
pub(crate) fn ensure_sysfs_dir(path: &Path) -> anyhow::Result<PathBuf> {
    let path = path.canonicalize()?;
    anyhow::ensure!(path.is_dir(), "{path:?} missing or not a directory");
    Ok(path)
}

/// Name of the kernel device owning a sysfs attribute
pub(crate) fn device_name(attr: &Path) -> anyhow::Result<String> {
    ensure_sysfs_dir(&attr.with_file_name("device"))
        .or_else(|_| ensure_sysfs_dir(&attr.with_file_name("driver")))
        .with_context(|| format!("Failed to get device/driver of {attr:?}"))?
        .file_name()
        .and_then(|f| f.to_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow::anyhow!("Invalid device path for {attr:?}"))
}

/// Index at the end of an attribute name, like `2` for `pwm2`
pub(crate) fn attr_index(attr: &Path) -> anyhow::Result<usize> {
    attr.file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid path: {attr:?}"))?
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse::<usize>()
        .with_context(|| format!("No index in {attr:?}"))
}

/// Write value to attribute, newline terminated
pub(crate) fn write_value<T>(path: &Path, val: T) -> anyhow::Result<()>
where
    T: fmt::Display,
{
    fs::write(path, format!("{val}\n")).with_context(|| format!("Failed to write {path:?}"))
}

/// Read and parse attribute value
pub(crate) fn read_value<T>(path: &Path) -> anyhow::Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: Error + Send + Sync + 'static,
{
    // Single read, FIFOs used in tests never reach EOF
    let mut buf = [0; 32];
    let count = File::open(path)
        .and_then(|mut f| f.read(&mut buf))
        .with_context(|| format!("Failed to read {path:?}"))?;
    let s = str::from_utf8(buf.get(..count).unwrap_or_default())?.trim_end();
    Ok(s.parse::<T>()?)
}
