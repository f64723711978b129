//! Production [`Luks2`] engine backed by the `cryptsetup` command line
//! tool.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Error};

use osutils::cryptsetup;

use super::{FormatOptions, Luks2, NativeRenameError, SlotToken, TOKEN_TYPE};

/// LUKS2 engine that shells out to `cryptsetup`.
#[derive(Debug, Default)]
pub struct CryptsetupLuks2;

fn keyslot_numbers(device: &Path) -> Result<BTreeSet<u32>, Error> {
    let header = cryptsetup::dump_header(device)?;
    header
        .keyslots
        .keys()
        .map(|k| {
            k.parse::<u32>()
                .with_context(|| format!("Malformed keyslot number '{}'", k))
        })
        .collect()
}

impl Luks2 for CryptsetupLuks2 {
    fn format(
        &mut self,
        device: &Path,
        label: &str,
        key: &[u8],
        opts: &FormatOptions,
    ) -> Result<(), Error> {
        cryptsetup::format(
            device,
            label,
            key,
            &cryptsetup::FormatOpts {
                inline_crypto_engine: opts.inline_crypto_engine,
            },
        )
    }

    fn add_key(
        &mut self,
        device: &Path,
        existing_key: &[u8],
        new_key: &[u8],
    ) -> Result<u32, Error> {
        // cryptsetup does not report the assigned keyslot, so diff the
        // header around the addition.
        let before = keyslot_numbers(device)?;
        cryptsetup::add_key(device, existing_key, new_key, None)?;
        let after = keyslot_numbers(device)?;

        after
            .difference(&before)
            .next()
            .copied()
            .context("luksAddKey succeeded but no new keyslot appeared")
    }

    fn kill_slot(&mut self, device: &Path, keyslot: u32) -> Result<(), Error> {
        cryptsetup::kill_slot(device, keyslot)
    }

    fn verify_key(&self, device: &Path, key: &[u8], keyslot: Option<u32>) -> Result<bool, Error> {
        Ok(cryptsetup::verify_key(device, key, keyslot).is_ok())
    }

    fn tokens(&self, device: &Path) -> Result<Vec<(u32, SlotToken)>, Error> {
        let header = cryptsetup::dump_header(device)?;
        let mut tokens = Vec::new();
        for (id, value) in header.tokens {
            if value.get("type").and_then(|t| t.as_str()) != Some(TOKEN_TYPE) {
                continue;
            }
            let id: u32 = id
                .parse()
                .with_context(|| format!("Malformed token id '{}'", id))?;
            let token: SlotToken = serde_json::from_value(value)
                .with_context(|| format!("Malformed slot token {id}"))?;
            tokens.push((id, token));
        }
        tokens.sort_by_key(|(id, _)| *id);
        Ok(tokens)
    }

    fn import_token(
        &mut self,
        device: &Path,
        token: &SlotToken,
        replace_id: Option<u32>,
    ) -> Result<(), Error> {
        let json = serde_json::to_vec(token).context("Failed to serialize slot token")?;
        cryptsetup::import_token(device, &json, replace_id)
    }

    fn remove_token(&mut self, device: &Path, token_id: u32) -> Result<(), Error> {
        cryptsetup::remove_token(device, token_id)
    }

    fn rename_token(
        &mut self,
        _device: &Path,
        _old: &str,
        _new: &str,
    ) -> Result<(), NativeRenameError> {
        // The cryptsetup CLI has no token rename; the manager copies and
        // removes instead.
        Err(NativeRenameError::Unsupported)
    }

    fn is_luks2(&self, device: &Path) -> bool {
        cryptsetup::is_luks2(device)
    }
}
