//! Stable volume identities from udev's by-uuid links.

use std::fs;
use std::path::Path;

use crate::constants::BY_UUID_DIR;

/// Identity for the volume on `device`.
pub fn volume_identity(device: &Path) -> String {
    volume_identity_in(Path::new(BY_UUID_DIR), device)
}

/// Look for a link in `by_uuid_dir` resolving to `device` and return
/// `uuid:<name>`. Without one the device path stands in, which is only
/// stable for as long as the device keeps its node.
pub fn volume_identity_in(by_uuid_dir: &Path, device: &Path) -> String {
    let fallback = || device.to_string_lossy().into_owned();
    let Ok(target) = fs::canonicalize(device) else {
        return fallback();
    };
    let Ok(links) = fs::read_dir(by_uuid_dir) else {
        return fallback();
    };
    let mut names: Vec<String> = links
        .filter_map(Result::ok)
        .filter(|link| fs::canonicalize(link.path()).is_ok_and(|t| t == target))
        .map(|link| link.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    match names.into_iter().next() {
        Some(uuid) => format!("uuid:{uuid}"),
        None => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn uuid_link_names_the_volume() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("dev");
        let by_uuid = dir.path().join("by-uuid");
        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(&by_uuid).unwrap();
        fs::write(dev.join("sdb1"), b"").unwrap();
        fs::write(dev.join("sdc1"), b"").unwrap();
        symlink("../dev/sdb1", by_uuid.join("1234-ABCD")).unwrap();
        symlink(dev.join("sdc1"), by_uuid.join("5678-EF01")).unwrap();

        assert_eq!(volume_identity_in(&by_uuid, &dev.join("sdb1")), "uuid:1234-ABCD");
        assert_eq!(volume_identity_in(&by_uuid, &dev.join("sdc1")), "uuid:5678-EF01");
    }

    #[test]
    fn unlinked_device_falls_back_to_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let by_uuid = dir.path().join("by-uuid");
        fs::create_dir_all(&by_uuid).unwrap();
        let dev = dir.path().join("sdd1");
        fs::write(&dev, b"").unwrap();

        let path = dev.to_string_lossy().into_owned();
        assert_eq!(volume_identity_in(&by_uuid, &dev), path);
        assert_eq!(
            volume_identity_in(&dir.path().join("missing"), Path::new("/dev/none")),
            "/dev/none"
        );
    }
}
