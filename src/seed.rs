use num_bigint::BigUint;
use num_traits::One;
use tracing::debug;

use crate::crypto::atom_bytes_padded;
use crate::error::AmesError;
use crate::noun::jam::{cue, jam};
use crate::noun::Noun;
use crate::ship::{Life, Ship};

/// Tag byte of a ring, i.e. a pair of private key seeds
const RING_TAG: u8 = b'B';

/// The local ship's identity and private key material
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub ship: Ship,
    pub life: Life,
    /// ed25519 seed from which the key exchange scalar is derived
    pub encryption_seed: [u8; 32],
    pub authentication_seed: [u8; 32],
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("ship", &self.ship)
            .field("life", &self.life)
            .finish_non_exhaustive()
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    AmesError::InvalidSeed(msg.into()).into()
}

impl Identity {
    /// Parses the hex encoding (with or without `0x`) of `jam([ship life ring ~])`, where the
    ///  ring is `'B'` followed by the 32 byte authentication seed and the 32 byte encryption seed.
    pub fn from_hex_seed(seed: &str) -> anyhow::Result<Identity> {
        let trimmed = seed.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let digits = if digits.len() % 2 == 1 { format!("0{}", digits) } else { digits.to_string() };

        let bytes = hex::decode(&digits)
            .map_err(|e| invalid(format!("not a hex string: {}", e)))?;
        let noun = cue(&BigUint::from_bytes_be(&bytes))
            .map_err(|e| invalid(format!("not a jammed noun: {}", e)))?;

        let ship = noun.head()
            .and_then(|n| n.as_atom().cloned())
            .map_err(|_| invalid("missing ship"))?;
        let ship = u128::try_from(&ship)
            .map_err(|_| invalid("ship exceeds 128 bits"))?;

        let rest = noun.tail().map_err(|_| invalid("missing life"))?;
        let life = rest.head()
            .and_then(|n| n.as_u32())
            .map_err(|_| invalid("missing or oversized life"))?;

        let ring = rest.tail()
            .and_then(|n| n.head())
            .and_then(|n| n.as_atom().cloned())
            .map_err(|_| invalid("missing ring"))?;

        let tag = atom_bytes_padded(&ring, 1)[0];
        if tag != RING_TAG {
            return Err(invalid(format!("unsupported ring tag {:#x}", tag)));
        }
        let body = ring >> 8u32;
        if body.bits() > 512 {
            return Err(invalid("ring exceeds 64 bytes"));
        }

        let low_mask = (BigUint::one() << 256u32) - 1u32;
        let authentication_seed = to_seed(&(&body & &low_mask));
        let encryption_seed = to_seed(&(&body >> 256u32));

        debug!(ship = %Ship(ship), life, "parsed identity");
        Ok(Identity {
            ship: Ship(ship),
            life,
            encryption_seed,
            authentication_seed,
        })
    }

    pub fn to_hex_seed(&self) -> String {
        let ring = (BigUint::from_bytes_le(&self.encryption_seed) << 256u32
            | BigUint::from_bytes_le(&self.authentication_seed)) << 8u32
            | BigUint::from(RING_TAG);

        let noun = Noun::tuple(self.ship.to_noun(), &[
            (self.life as u64).into(),
            ring.into(),
            0u64.into(),
        ]);
        format!("0x{}", jam(&noun).to_str_radix(16))
    }
}

fn to_seed(atom: &BigUint) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&atom_bytes_padded(atom, 32));
    seed
}
