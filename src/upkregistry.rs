use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// A registered package: the name it was registered under and the file it
/// was loaded from. Lookup is name-level only; the handle carries no access
/// to the package contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageHandle {
    pub package_name: String,
    pub upk_name: String,
}

static PACKAGES: LazyLock<Mutex<HashMap<String, PackageHandle>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Idempotent: a registration for an already-present name is ignored.
pub fn register_package(handle: PackageHandle) {
    if let Ok(mut packages) = PACKAGES.lock() {
        packages.entry(handle.package_name.clone()).or_insert(handle);
    }
}

pub fn unregister_package(name: &str) {
    if let Ok(mut packages) = PACKAGES.lock() {
        packages.remove(name);
    }
}

pub fn find_package(name: &str) -> Option<PackageHandle> {
    PACKAGES.lock().ok()?.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_find_unregister() {
        let handle = PackageHandle {
            package_name: "RegistryProbe".into(),
            upk_name: "RegistryProbe.upk".into(),
        };
        register_package(handle.clone());
        assert_eq!(find_package("RegistryProbe"), Some(handle));
        unregister_package("RegistryProbe");
        assert_eq!(find_package("RegistryProbe"), None);
    }

    #[test]
    fn registration_is_idempotent() {
        register_package(PackageHandle {
            package_name: "RegistryDup".into(),
            upk_name: "first.upk".into(),
        });
        register_package(PackageHandle {
            package_name: "RegistryDup".into(),
            upk_name: "second.upk".into(),
        });
        let found = find_package("RegistryDup").unwrap();
        assert_eq!(found.upk_name, "first.upk");
        unregister_package("RegistryDup");
    }
}
