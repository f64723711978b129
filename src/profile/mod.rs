//! PCR protection profile construction. A profile is a disjunction of
//! branches; each branch conjoins sub-profiles over one enumerated boot
//! path. Sealing succeeds if the current PCR bank matches any branch.

pub mod loadchain;

use std::fmt;
use std::path::Path;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use diskseal_api::error::{ReportError, SealError, SealingError};
use sysdefs::tpm2::Pcr;

use crate::profile::loadchain::{ImageRef, ImageSource, LoadChain};

/// PCR index that the kernel-cmdline and device-identity sub-profiles
/// measure into.
pub const POLICY_PCR: Pcr = Pcr::Pcr12;

/// Reads a member file out of a snap container image. The container format
/// itself is outside this crate; production code goes through
/// `unsquashfs`.
pub trait SnapImageReader {
    fn read_member(&self, container: &Path, member: &str) -> Result<Vec<u8>, Error>;
}

/// Production reader backed by `unsquashfs -cat`.
pub struct SquashfsImageReader;

impl SnapImageReader for SquashfsImageReader {
    fn read_member(&self, container: &Path, member: &str) -> Result<Vec<u8>, Error> {
        osutils::squashfs::cat_file(container, member)
    }
}

/// A device-identity descriptor. The canonical byte form feeds both the
/// identity sub-profile digest and the model authorization HMACs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub series: String,
    pub brand_id: String,
    pub model: String,
    pub grade: String,
    pub sign_key_id: String,
}

impl Model {
    /// Deterministic serialization of the assertion headers, in fixed
    /// field order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "series:{}\nbrand-id:{}\nmodel:{}\ngrade:{}\nsign-key-sha3-384:{}\n",
            self.series, self.brand_id, self.model, self.grade, self.sign_key_id
        )
        .into_bytes()
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.canonical_bytes()).into()
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.brand_id, self.model)
    }
}

/// Optional secure-boot signature database update to fold into the
/// secure-boot sub-profile, so both pre- and post-update PCR values
/// satisfy the branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigDbUpdate {
    pub payload: Vec<u8>,
}

/// One per-model parameter set consumed by the profile builder.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub load_chains: Vec<LoadChain>,
    pub kernel_cmdlines: Vec<String>,
    pub model: Model,
    pub boot_modes: Vec<String>,
    pub sig_db_update: Option<SigDbUpdate>,
}

/// An image materialized at profile-build time: its measurement digest
/// plus enough provenance for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub source: ImageSource,
    pub digest: [u8; 32],
    pub origin: String,
}

/// One conjoined predicate of a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum SubProfile {
    SecureBootPolicy {
        images: Vec<ResolvedImage>,
        db_update: Option<Vec<u8>>,
    },
    BootManagerCode {
        images: Vec<ResolvedImage>,
    },
    KernelCmdline {
        pcr: Pcr,
        cmdlines: Vec<String>,
    },
    DeviceIdentity {
        pcr: Pcr,
        model_digest: [u8; 32],
        boot_modes: Vec<String>,
    },
}

/// One branch: all sub-profiles must hold for the branch to match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcrBranch {
    pub sub_profiles: Vec<SubProfile>,
}

/// The complete protection profile: a disjunction over branches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcrProfile {
    pub branches: Vec<PcrBranch>,
}

impl PcrProfile {
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

fn add_sub_profile_error(sub_profile: &'static str) -> SealingError {
    SealingError::AddSubProfile {
        sub_profile: sub_profile.to_string(),
    }
}

fn resolve_image(
    chain: &LoadChain,
    node: loadchain::NodeId,
    reader: &dyn SnapImageReader,
) -> Result<ResolvedImage, Error> {
    let node = chain.node(node);
    let (bytes, origin) = match &node.image {
        ImageRef::Path(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Cannot open boot image '{}'", path.display()))?;
            (bytes, path.display().to_string())
        }
        ImageRef::Container { container, member } => {
            let bytes = reader.read_member(container, member).with_context(|| {
                format!(
                    "Cannot read boot image '{}' from container '{}'",
                    member,
                    container.display()
                )
            })?;
            (bytes, format!("{}:{}", container.display(), member))
        }
    };
    Ok(ResolvedImage {
        source: node.source,
        digest: Sha256::digest(&bytes).into(),
        origin,
    })
}

/// Builds the PCR protection profile for the given model parameter sets.
///
/// Every root-to-leaf path of every load chain becomes one branch,
/// composed of the secure-boot-policy, boot-manager, kernel-cmdline and
/// device-identity sub-profiles, in that order. Branch enumeration is
/// deterministic: parameter sets, chains, and DAG paths are visited in
/// supplied order.
pub fn build_pcr_profile(
    params: &[ModelParams],
    reader: &dyn SnapImageReader,
) -> Result<PcrProfile, SealError> {
    let mut profile = PcrProfile::default();

    for model_params in params {
        for chain in &model_params.load_chains {
            for sequence in chain.sequences()? {
                let mut images = Vec::with_capacity(sequence.len());
                for node in &sequence {
                    images.push(
                        resolve_image(chain, *node, reader)
                            .structured(add_sub_profile_error("secure-boot-policy"))?,
                    );
                }

                let mut branch = PcrBranch::default();
                branch.sub_profiles.push(SubProfile::SecureBootPolicy {
                    images: images.clone(),
                    db_update: model_params
                        .sig_db_update
                        .as_ref()
                        .map(|update| update.payload.clone()),
                });
                branch
                    .sub_profiles
                    .push(SubProfile::BootManagerCode { images });
                branch.sub_profiles.push(SubProfile::KernelCmdline {
                    pcr: POLICY_PCR,
                    cmdlines: model_params.kernel_cmdlines.clone(),
                });
                branch.sub_profiles.push(SubProfile::DeviceIdentity {
                    pcr: POLICY_PCR,
                    model_digest: model_params.model.digest(),
                    boot_modes: model_params.boot_modes.clone(),
                });

                profile.branches.push(branch);
            }
        }
    }

    Ok(profile)
}
