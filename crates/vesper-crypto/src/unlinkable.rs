//! Unlinkable address scheme and deterministic spend-key windows.
//!
//! An unlinkable address is the pair (S, S_V = v*S). The sender picks a
//! fresh scalar `a` per output and publishes E = a*S together with the
//! output key P = q*S, where q = H_s(a*S_V || tx_inputs_hash || varint(i)).
//! The receiver recovers a*S_V as v*E, recomputes q, and unblinds S as
//! q^-1 * P. Spending uses the scalar p = q*s with p*G == P.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;

use crate::{cn_fast_hash, encode_varint, Hash, KeyPair, PublicKey, SecretKey, SECRET_KEY_ZERO};

/// s_v component of an unlinkable address: view_secret * S.
pub fn generate_address_s_v(
    spend_public_key: &PublicKey,
    view_secret_key: &SecretKey,
) -> Option<PublicKey> {
    let s = CompressedEdwardsY(*spend_public_key).decompress()?;
    let v = Scalar::from_bytes_mod_order(*view_secret_key);
    Some((v * s).compress().to_bytes())
}

/// Fill `result` with deterministic spend keypairs starting at `index`.
///
/// Record i gets delta = H_s(view_seed || "hd_address" || varint(index + i)),
/// public = base.public + delta*G and secret = base.secret + delta. A zero
/// base secret (view-only wallet) yields zero record secrets.
pub fn generate_hd_spendkeys(
    base: &KeyPair,
    view_seed: &Hash,
    index: usize,
    result: &mut [KeyPair],
) {
    let base_point = CompressedEdwardsY(base.public_key)
        .decompress()
        .expect("spend key base must be a valid point");
    let base_secret: Option<Scalar> = if base.secret_key == SECRET_KEY_ZERO {
        None
    } else {
        Some(Scalar::from_bytes_mod_order(base.secret_key))
    };
    for (i, out) in result.iter_mut().enumerate() {
        let mut data = Vec::with_capacity(32 + 10 + 10);
        data.extend_from_slice(view_seed);
        data.extend_from_slice(b"hd_address");
        encode_varint((index + i) as u64, &mut data);
        let delta = Scalar::from_bytes_mod_order(cn_fast_hash(&data));
        out.public_key = (base_point + ED25519_BASEPOINT_TABLE * &delta)
            .compress()
            .to_bytes();
        out.secret_key = match base_secret {
            Some(b) => (b + delta).to_bytes(),
            None => SECRET_KEY_ZERO,
        };
    }
}

fn spend_scalar_for(output_secret_point: &[u8; 32], tx_inputs_hash: &Hash, output_index: usize) -> Scalar {
    let mut data = Vec::with_capacity(32 + 32 + 10);
    data.extend_from_slice(output_secret_point);
    data.extend_from_slice(tx_inputs_hash);
    encode_varint(output_index as u64, &mut data);
    Scalar::from_bytes_mod_order(cn_fast_hash(&data))
}

/// Sender side: derive the one-time output key for an unlinkable address.
///
/// `output_secret` is the sender's fresh per-output scalar. Writes the
/// encrypted output secret E = a*S and returns P = q*S.
pub fn unlinkable_derive_public_key(
    output_secret: &SecretKey,
    tx_inputs_hash: &Hash,
    output_index: usize,
    address_s: &PublicKey,
    address_s_v: &PublicKey,
    encrypted_output_secret: &mut PublicKey,
) -> Option<PublicKey> {
    let s = CompressedEdwardsY(*address_s).decompress()?;
    let s_v = CompressedEdwardsY(*address_s_v).decompress()?;
    let a = Scalar::from_bytes_mod_order(*output_secret);
    *encrypted_output_secret = (a * s).compress().to_bytes();
    let t = (a * s_v).compress().to_bytes();
    let q = spend_scalar_for(&t, tx_inputs_hash, output_index);
    Some((q * s).compress().to_bytes())
}

/// Receiver side: unblind the address spend key from an output.
///
/// Also yields the spend scalar q needed to derive the output secret key.
/// Invalid points map to the zero key, which never matches a wallet record.
pub fn unlinkable_underive_public_key(
    view_secret_key: &SecretKey,
    tx_inputs_hash: &Hash,
    output_index: usize,
    output_public_key: &PublicKey,
    encrypted_output_secret: &PublicKey,
    spend_scalar: &mut SecretKey,
) -> PublicKey {
    let p = match CompressedEdwardsY(*output_public_key).decompress() {
        Some(p) => p,
        None => return [0u8; 32],
    };
    let e = match CompressedEdwardsY(*encrypted_output_secret).decompress() {
        Some(e) => e,
        None => return [0u8; 32],
    };
    let v = Scalar::from_bytes_mod_order(*view_secret_key);
    let t = (v * e).compress().to_bytes();
    let q = spend_scalar_for(&t, tx_inputs_hash, output_index);
    *spend_scalar = q.to_bytes();
    (q.invert() * p).compress().to_bytes()
}

/// Output secret key p = q*s for a detected output.
pub fn unlinkable_derive_secret_key(
    spend_secret_key: &SecretKey,
    spend_scalar: &SecretKey,
) -> SecretKey {
    let s = Scalar::from_bytes_mod_order(*spend_secret_key);
    let q = Scalar::from_bytes_mod_order(*spend_scalar);
    (q * s).to_bytes()
}
