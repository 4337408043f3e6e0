//! Fragment attachment, both while a host resolves and dynamically to an
//! already resolved host.

use super::{ImportRef, ResolveView, Resolver};
use crate::core::{ResolutionError, RevisionKey};
use crate::package::{ExportPkg, ImportPkg};
use keel_core::manifest::BundleManifest;
use tracing::{debug, warn};

impl<'a, V: ResolveView> Resolver<'a, V> {
    /// Live fragments whose host constraint matches `host`, ascending by id.
    fn fragments_for(&self, host: &BundleManifest) -> Vec<RevisionKey> {
        let view = self.view;
        view.live_revisions()
            .into_iter()
            .filter(|k| {
                view.manifest(*k)
                    .and_then(|m| m.fragment_host.as_ref())
                    .is_some_and(|h| h.name == host.symbolic_name && h.range.includes(&host.version))
            })
            .collect()
    }

    fn is_attached(&self, host: RevisionKey, fragment: RevisionKey) -> bool {
        self.registry.fragments_of(host).contains(&fragment)
            || self.txn.plan.attachments.contains(&(host, fragment))
    }

    /// Attach every matching fragment to a host being resolved. A fragment
    /// that does not wire is skipped and recorded as a warning.
    pub(super) fn attach_fragments(&mut self, host: RevisionKey, manifest: &BundleManifest) {
        for fragment in self.fragments_for(manifest) {
            if self.is_attached(host, fragment) {
                continue;
            }
            let snapshot = self.txn.clone();
            if let Err(e) = self.attach_fragment(host, fragment) {
                warn!(host = %host, fragment = %fragment, error = %e, "skipping fragment");
                self.txn = snapshot;
                self.txn.plan.warnings.push(e);
            }
        }
    }

    /// Merge one fragment's declarations into the host's space.
    pub(super) fn attach_fragment(
        &mut self,
        host: RevisionKey,
        fragment: RevisionKey,
    ) -> Result<(), ResolutionError> {
        let view = self.view;
        let attach_error = |reason: String| ResolutionError::FragmentAttach {
            fragment: fragment.bundle,
            host: host.bundle,
            reason,
        };
        let (Some(host_manifest), Some(manifest)) = (view.manifest(host), view.manifest(fragment))
        else {
            return Err(attach_error("revision is no longer installed".to_string()));
        };

        for spec in &manifest.exports {
            let export = ExportPkg::new(
                spec,
                host,
                &host_manifest.symbolic_name,
                &host_manifest.version,
                Some(fragment),
            )
            .map_err(|e| attach_error(e.to_string()))?;
            self.txn.plan.exports.push(export);
        }

        for spec in &manifest.imports {
            let import = ImportPkg::new(spec, host, Some(fragment));
            let host_import = self
                .imports_in(host)
                .into_iter()
                .find(|i| self.import(*i).is_some_and(|i| i.name == spec.name));

            if let Some(host_import) = host_import {
                match self.provider_of(host_import) {
                    Some(provider) if self.export(provider).is_some_and(|e| e.matches(&import)) => {}
                    None if import.optional => {}
                    _ => {
                        return Err(attach_error(format!(
                            "import of {} {} is not satisfied by the host's provider",
                            spec.name, spec.range
                        )))
                    }
                }
                continue;
            }

            let index = self.txn.plan.imports.len();
            self.txn.plan.imports.push(import.clone());
            if let Some(provider) = self.choose_provider(host, &import, fragment.bundle)? {
                self.txn
                    .plan
                    .wires
                    .insert(ImportRef::Planned(index), provider);
            }
        }

        for spec in &manifest.requires {
            self.resolve_require(host, spec, Some(fragment), fragment.bundle)?;
        }

        self.txn.plan.attachments.push((host, fragment));
        debug!(host = %host, fragment = %fragment, "planned fragment attachment");
        Ok(())
    }

    /// Resolve a fragment by attaching it to its matching hosts. Unresolved
    /// hosts are resolved (which attaches the fragment); resolved hosts get
    /// a dynamic attach, restricted to classpath-only fragments when the
    /// host is active.
    pub(super) fn resolve_fragment(
        &mut self,
        fragment: RevisionKey,
        manifest: &BundleManifest,
    ) -> Result<(), ResolutionError> {
        let view = self.view;
        let Some(host_spec) = manifest.fragment_host.as_ref() else {
            return Ok(());
        };
        let hosts: Vec<RevisionKey> = view
            .live_revisions()
            .into_iter()
            .filter(|k| {
                view.manifest(*k).is_some_and(|m| {
                    !m.is_fragment()
                        && m.symbolic_name == host_spec.name
                        && host_spec.range.includes(&m.version)
                })
            })
            .collect();

        if hosts.is_empty() {
            return Err(ResolutionError::MissingHost {
                bundle: fragment.bundle,
                host: host_spec.name.clone(),
                range: host_spec.range.to_string(),
            });
        }

        let mut attached = false;
        let mut first_error = None;
        for host in hosts {
            if self.is_attached(host, fragment) {
                attached = true;
                continue;
            }

            let snapshot = self.txn.clone();
            let result = if !self.is_resolved(host) {
                self.resolve_bundle(host).and_then(|()| {
                    if self.is_attached(host, fragment) {
                        Ok(())
                    } else {
                        let recorded = self
                            .txn
                            .plan
                            .warnings
                            .iter()
                            .rev()
                            .find(|w| w.bundle() == fragment.bundle)
                            .cloned();
                        Err(recorded.unwrap_or_else(|| ResolutionError::FragmentAttach {
                            fragment: fragment.bundle,
                            host: host.bundle,
                            reason: "fragment did not attach".to_string(),
                        }))
                    }
                })
            } else if view.is_active(host) {
                let mandatory = manifest.imports.iter().any(|i| !i.optional)
                    || manifest.requires.iter().any(|r| !r.optional);
                if mandatory {
                    Err(ResolutionError::FragmentAttach {
                        fragment: fragment.bundle,
                        host: host.bundle,
                        reason: "host is active and the fragment adds mandatory imports or required bundles"
                            .to_string(),
                    })
                } else {
                    self.attach_fragment(host, fragment)
                }
            } else {
                self.attach_fragment(host, fragment)
            };

            match result {
                Ok(()) => attached = true,
                Err(e) => {
                    self.txn = snapshot;
                    first_error.get_or_insert(e);
                }
            }
        }

        if attached {
            Ok(())
        } else {
            Err(first_error.unwrap_or_else(|| ResolutionError::MissingHost {
                bundle: fragment.bundle,
                host: host_spec.name.clone(),
                range: host_spec.range.to_string(),
            }))
        }
    }
}
