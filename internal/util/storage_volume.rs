use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeUsage {
    pub capacity_bytes: i64,
    pub free_bytes: i64,
}

impl VolumeUsage {
    pub fn used_percent(&self) -> f64 {
        if self.capacity_bytes <= 0 {
            return 0.0;
        }
        let used = self.capacity_bytes.saturating_sub(self.free_bytes).max(0);
        used as f64 * 100.0 / self.capacity_bytes as f64
    }
}

fn to_i64_saturated(value: u128) -> i64 {
    value.min(i64::MAX as u128) as i64
}

#[cfg(unix)]
pub fn path_usage(path: &Path) -> Option<VolumeUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let raw = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(raw.as_ptr(), &mut stat) };
    if result != 0 {
        return None;
    }
    let block_size = u128::from(stat.f_frsize.max(stat.f_bsize));
    let capacity = block_size.saturating_mul(u128::from(stat.f_blocks));
    let free = block_size.saturating_mul(u128::from(stat.f_bavail));
    Some(VolumeUsage {
        capacity_bytes: to_i64_saturated(capacity),
        free_bytes: to_i64_saturated(free),
    })
}

#[cfg(not(unix))]
pub fn path_usage(_path: &Path) -> Option<VolumeUsage> {
    None
}
