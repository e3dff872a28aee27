//! Interface name resolution and allocation

use std::sync::Arc;

use wgk_tun::platform::Platform;

use crate::backend::Backend;
use crate::config::VpnConfiguration;
use crate::error::{Error, Result};
use crate::names::NameMapping;

/// Outcome of [`InterfaceAllocator::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub friendly: Option<String>,
    pub native: Option<String>,
    /// Whether a specific interface was settled on (otherwise a free slot is scanned for)
    pub resolved: bool,
}

impl ResolvedName {
    pub fn unresolved() -> Self {
        Self {
            friendly: None,
            native: None,
            resolved: false,
        }
    }
}

/// An interface picked for a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Name the user sees
    pub name: String,
    /// Name the OS uses
    pub native: String,
    /// Whether the interface was created by this allocation
    pub created: bool,
}

/// Picks or creates the interface a tunnel runs on
pub struct InterfaceAllocator {
    platform: Arc<dyn Platform>,
    backend: Arc<dyn Backend>,
    names: NameMapping,
    prefix: String,
    max_interfaces: u32,
}

impl InterfaceAllocator {
    pub fn new(
        platform: Arc<dyn Platform>,
        backend: Arc<dyn Backend>,
        names: NameMapping,
        prefix: Option<String>,
        max_interfaces: u32,
    ) -> Self {
        let prefix = prefix.unwrap_or_else(|| platform.interface_prefix().to_string());
        Self {
            platform,
            backend,
            names,
            prefix,
            max_interfaces,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Work out which interface the request refers to
    pub fn resolve(
        &self,
        configuration: &VpnConfiguration,
        friendly: Option<&str>,
        native: Option<&str>,
    ) -> Result<ResolvedName> {
        match (friendly, native) {
            (_, Some(native)) => Ok(ResolvedName {
                friendly: Some(friendly.unwrap_or(native).to_string()),
                native: Some(native.to_string()),
                resolved: true,
            }),
            (Some(friendly), None) => {
                let native = match self.names.native_of(friendly)? {
                    Some(n) => Some(n),
                    None if self.platform.names_freely_chosen() => Some(friendly.to_string()),
                    None => None,
                };
                Ok(ResolvedName {
                    friendly: Some(friendly.to_string()),
                    native,
                    resolved: true,
                })
            }
            (None, None) => {
                for native in self.platform.interfaces()? {
                    if self.backend.public_key(&native)?.as_deref() == Some(configuration.public_key()) {
                        let friendly = self.names.friendly_of(&native)?.unwrap_or_else(|| native.clone());
                        log::info!("Found existing interface {} for this configuration", native);
                        return Ok(ResolvedName {
                            friendly: Some(friendly),
                            native: Some(native),
                            resolved: true,
                        });
                    }
                }
                Ok(ResolvedName::unresolved())
            }
        }
    }

    /// Reuse or create the interface for a resolved (or unresolved) name
    pub fn find_or_create(
        &self,
        resolved: &ResolvedName,
        configuration: &VpnConfiguration,
        fail_if_in_use: bool,
    ) -> Result<Allocation> {
        if !resolved.resolved {
            return self.scan(configuration);
        }

        let friendly = resolved
            .friendly
            .clone()
            .or_else(|| resolved.native.clone())
            .ok_or_else(|| Error::ConfigurationInvalid("no interface name".into()))?;

        if let Some(ref native) = resolved.native {
            if self.platform.exists(native)? {
                if self.backend.public_key(native)?.is_some() && fail_if_in_use {
                    return Err(Error::InUseConflict(native.clone()));
                }
                log::info!("Reusing interface {}", native);
                return Ok(Allocation {
                    name: friendly,
                    native: native.clone(),
                    created: false,
                });
            }
        }

        self.create(&friendly)
    }

    /// Scan `prefix0 .. prefix(MAX-1)` for a free slot
    fn scan(&self, configuration: &VpnConfiguration) -> Result<Allocation> {
        let live = self.platform.interfaces()?;
        let own_key = configuration.public_key();

        for index in 0..self.max_interfaces {
            let candidate = format!("{}{}", self.prefix, index);
            // Without a mapping the candidate is its own native name
            let native = self
                .names
                .native_of(&candidate)?
                .unwrap_or_else(|| candidate.clone());

            if !live.contains(&native) {
                log::debug!("{} is free, creating it", candidate);
                return self.create(&candidate);
            }

            match self.backend.public_key(&native)? {
                None => {
                    log::info!("Reusing unbound interface {}", native);
                    return Ok(Allocation {
                        name: candidate,
                        native,
                        created: false,
                    });
                }
                Some(key) if key == own_key => return Err(Error::InUseConflict(native)),
                Some(_) => log::debug!("{} belongs to another tunnel", native),
            }
        }

        Err(Error::AllocationExhausted(self.max_interfaces))
    }

    fn create(&self, friendly: &str) -> Result<Allocation> {
        let native = self.platform.create(friendly)?;
        if let Err(e) = self.names.commit(friendly, &native) {
            log::warn!("Could not record name mapping for {}, removing it", native);
            if let Err(del) = self.platform.delete(&native) {
                log::warn!("Failed to delete {}: {}", native, del);
            }
            return Err(e);
        }
        Ok(Allocation {
            name: friendly.to_string(),
            native,
            created: true,
        })
    }

    /// Forget the name mapping of a torn down interface
    pub fn release(&self, friendly: &str) -> Result<()> {
        self.names.unmap(friendly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{PEER, PEER2, PRIVATE, PUBLIC};
    use crate::names::MemoryKeyStore;
    use crate::testing::{FakeBackend, FakePlatform};

    fn configuration() -> VpnConfiguration {
        VpnConfiguration::new(PRIVATE, PUBLIC)
    }

    fn allocator(platform: FakePlatform, backend: FakeBackend, max: u32) -> (Arc<FakePlatform>, NameMapping, InterfaceAllocator) {
        let platform = Arc::new(platform);
        let names = NameMapping::new(Arc::new(MemoryKeyStore::new()));
        let alloc = InterfaceAllocator::new(platform.clone(), Arc::new(backend), names.clone(), None, max);
        (platform, names, alloc)
    }

    #[test]
    fn test_reuse_before_create() {
        let (platform, _, alloc) = allocator(
            FakePlatform::new("wg").with_link("wg0").with_link("wg1"),
            FakeBackend::new().with_bound("wg0", PEER),
            5,
        );
        let config = configuration();
        let resolved = alloc.resolve(&config, None, None).unwrap();
        assert!(!resolved.resolved);

        let a = alloc.find_or_create(&resolved, &config, true).unwrap();
        assert_eq!(a.native, "wg1");
        assert!(!a.created);
        assert_eq!(platform.count("create"), 0);
    }

    #[test]
    fn test_same_key_conflicts() {
        let (_, _, alloc) = allocator(
            FakePlatform::new("wg").with_link("wg0"),
            FakeBackend::new().with_bound("wg0", PUBLIC),
            5,
        );
        let config = configuration();
        let err = alloc
            .find_or_create(&ResolvedName::unresolved(), &config, true)
            .unwrap_err();
        assert!(matches!(err, Error::InUseConflict(ref n) if n == "wg0"));
    }

    #[test]
    fn test_first_absent_index_is_created() {
        let (platform, names, alloc) = allocator(
            FakePlatform::new("wg").with_link("wg0").with_link("wg2"),
            FakeBackend::new().with_bound("wg0", PEER).with_bound("wg2", PEER2),
            5,
        );
        let a = alloc
            .find_or_create(&ResolvedName::unresolved(), &configuration(), true)
            .unwrap();
        assert_eq!(a.native, "wg1");
        assert!(a.created);
        assert_eq!(platform.calls(), vec!["create wg1"]);
        assert_eq!(names.native_of("wg1").unwrap().as_deref(), Some("wg1"));
    }

    #[test]
    fn test_exhausted() {
        let (_, _, alloc) = allocator(
            FakePlatform::new("wg").with_link("wg0").with_link("wg1"),
            FakeBackend::new().with_bound("wg0", PEER).with_bound("wg1", PEER2),
            2,
        );
        let err = alloc
            .find_or_create(&ResolvedName::unresolved(), &configuration(), true)
            .unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted(2)));
    }

    #[test]
    fn test_resolve_adopts_interface_with_our_key() {
        let (_, names, alloc) = allocator(
            FakePlatform::assigned_names("utun", 4).with_link("utun4"),
            FakeBackend::new().with_bound("utun4", PUBLIC),
            5,
        );
        names.commit("office", "utun4").unwrap();
        let resolved = alloc.resolve(&configuration(), None, None).unwrap();
        assert_eq!(resolved.friendly.as_deref(), Some("office"));
        assert_eq!(resolved.native.as_deref(), Some("utun4"));
        assert!(resolved.resolved);
    }

    #[test]
    fn test_resolve_friendly_name() {
        let (_, names, alloc) = allocator(FakePlatform::assigned_names("utun", 4), FakeBackend::new(), 5);
        let config = configuration();

        let r = alloc.resolve(&config, Some("office"), None).unwrap();
        assert_eq!(r.native, None);
        assert!(r.resolved);

        names.commit("office", "utun9").unwrap();
        let r = alloc.resolve(&config, Some("office"), None).unwrap();
        assert_eq!(r.native.as_deref(), Some("utun9"));

        let (_, _, alloc) = allocator(FakePlatform::new("wg"), FakeBackend::new(), 5);
        let r = alloc.resolve(&config, Some("home"), None).unwrap();
        assert_eq!(r.native.as_deref(), Some("home"));
    }

    #[test]
    fn test_named_interface_created_with_assigned_name() {
        let (platform, names, alloc) = allocator(FakePlatform::assigned_names("utun", 4), FakeBackend::new(), 5);
        let config = configuration();
        let r = alloc.resolve(&config, Some("office"), None).unwrap();
        let a = alloc.find_or_create(&r, &config, true).unwrap();
        assert_eq!(a.name, "office");
        assert_eq!(a.native, "utun4");
        assert_eq!(platform.calls(), vec!["create office"]);
        assert_eq!(names.friendly_of("utun4").unwrap().as_deref(), Some("office"));

        alloc.release("office").unwrap();
        alloc.release("office").unwrap();
        assert_eq!(names.native_of("office").unwrap(), None);
    }

    #[test]
    fn test_named_interface_in_use() {
        let (_, _, alloc) = allocator(
            FakePlatform::new("wg").with_link("home"),
            FakeBackend::new().with_bound("home", PEER),
            5,
        );
        let config = configuration();
        let r = alloc.resolve(&config, Some("home"), None).unwrap();
        assert!(matches!(
            alloc.find_or_create(&r, &config, true),
            Err(Error::InUseConflict(_))
        ));
        let a = alloc.find_or_create(&r, &config, false).unwrap();
        assert!(!a.created);
    }

    #[test]
    fn test_create_failure_leaves_no_mapping() {
        let (platform, names, alloc) = allocator(FakePlatform::new("wg"), FakeBackend::new(), 5);
        platform.fail("create");
        let err = alloc
            .find_or_create(&ResolvedName::unresolved(), &configuration(), true)
            .unwrap_err();
        assert!(err.is_command_failure());
        assert_eq!(names.native_of("wg0").unwrap(), None);
    }
}
