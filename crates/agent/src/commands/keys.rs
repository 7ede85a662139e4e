//! `wgmesh genkey` and `wgmesh pubkey`, compatible with `wg genkey` and
//! `wg pubkey`

use std::io::{BufRead, Write};
use wgmesh_common::{derive_public_key, generate_private_key, Key, Result};

/// Write a fresh base64 private key
pub fn genkey(out: &mut impl Write) -> anyhow::Result<()> {
    writeln!(out, "{}", generate_private_key()?)?;
    Ok(())
}

/// Read a base64 private key from `input`, write its public key
pub fn pubkey(input: &mut impl BufRead, out: &mut impl Write) -> anyhow::Result<()> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    writeln!(out, "{}", public_key_of(&line)?)?;
    Ok(())
}

fn public_key_of(private_key: &str) -> Result<Key> {
    Ok(derive_public_key(&Key::from_base64(private_key)?))
}
