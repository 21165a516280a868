//! Policy validation and rendering into nsjail configuration text.
//!
//! [`render_policy`] checks every mount against the declaration invariants,
//! drops optional mounts whose host source is missing, and writes the
//! result through the [`textproto`](crate::utils::textproto) writer:
//! scalar settings first, then one `mount { ... }` block per declaration in
//! declaration order.
//!
//! Optional mounts are filtered here rather than left to the engine so the
//! engine does not log a warning for every missing optional path.

use std::collections::HashSet;
use std::path::Path;

use crate::context::FsProbe;
use crate::error::JailError;
use crate::policy::{MountDeclaration, Policy};
use crate::utils::textproto::{Document, Value};

/// Validates `policy` and renders it as configuration text.
///
/// # Errors
///
/// Returns [`JailError::InvalidMount`] for the first declaration that
/// violates an invariant. Nothing is rendered in that case.
pub fn render_policy(policy: &Policy, probe: &dyn FsProbe) -> Result<String, JailError> {
    Ok(policy_document(policy, probe)?.render())
}

/// Builds the structured document for `policy` without rendering it.
pub fn policy_document(policy: &Policy, probe: &dyn FsProbe) -> Result<Document, JailError> {
    let mut doc = Document::new();
    for (key, value) in policy.settings().iter() {
        doc.push_field(key, value.clone());
    }

    let mut destinations: HashSet<&Path> = HashSet::new();
    for mount in policy.mounts() {
        mount.validate()?;

        if should_skip(mount, probe) {
            tracing::debug!("Skipping optional mount with missing source: {mount}");
            continue;
        }

        if let Some(dst) = mount.effective_destination() {
            if !destinations.insert(dst) {
                tracing::debug!("Destination {} declared again; later mount wins", dst.display());
            }
        }
        doc.push_block("mount", mount_block(mount));
    }

    Ok(doc)
}

fn should_skip(mount: &MountDeclaration, probe: &dyn FsProbe) -> bool {
    match mount.source() {
        Some(src) if !mount.is_mandatory() => !probe.exists(src),
        _ => false,
    }
}

/// Renders one validated declaration.
///
/// `mandatory` is only written when false since true is the engine default.
fn mount_block(mount: &MountDeclaration) -> Document {
    let mut block = Document::new();

    if let Some(src) = mount.source() {
        block.push_field("src", Value::from(src));
    }
    if let Some(dst) = mount.effective_destination() {
        block.push_field("dst", Value::from(dst));
    }
    block.push_field("is_bind", Value::Bool(mount.is_bind()));
    block.push_field("rw", Value::Bool(mount.is_writable()));
    if let Some(kind) = mount.kind() {
        block.push_field("fstype", Value::from(kind));
    }
    if !mount.is_mandatory() {
        block.push_field("mandatory", Value::Bool(false));
    }

    block
}
