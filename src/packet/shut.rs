use num_bigint::BigUint;
use num_traits::{One, ToPrimitive};

use crate::crypto::{atom_bytes, atom_bytes_padded, CryptoProvider, SymmetricKey};
use crate::error::AmesError;
use crate::noun::jam::{cue, jam};
use crate::noun::Noun;
use crate::packet::fragment::Fragment;
use crate::packet::wire::Packet;
use crate::ship::{Life, Ship};

const IV_BITS: u32 = 128;
const LEN_BITS: u32 = 16;

/// What an acknowledgment refers to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ack {
    /// a single fragment of a message
    Fragment(u32),
    /// The whole message, i.e. the final ack. `ok` is false if the receiving application
    ///  rejected the message.
    Message { ok: bool, lag: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Meat {
    Fragment { count: u32, index: u32, data: BigUint },
    Ack(Ack),
}

/// The plaintext of an encrypted packet: `[bone num meat]`, where meat is one of
///
/// ```ascii
///  [0 count index fragment]   data fragment
///  [1 0 index]                fragment ack
///  [1 1 ok lag]               message ack, ok = 0 for success
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutPacket {
    pub bone: u64,
    pub num: u64,
    pub meat: Meat,
}

impl ShutPacket {
    pub fn from_fragment(bone: u64, fragment: &Fragment) -> ShutPacket {
        ShutPacket {
            bone,
            num: fragment.num,
            meat: Meat::Fragment {
                count: fragment.count,
                index: fragment.index,
                data: fragment.data.clone(),
            },
        }
    }

    pub fn ack(bone: u64, num: u64, ack: Ack) -> ShutPacket {
        ShutPacket {
            bone,
            num,
            meat: Meat::Ack(ack),
        }
    }

    pub fn fragment(&self) -> Option<Fragment> {
        match &self.meat {
            Meat::Fragment { count, index, data } => Some(Fragment {
                num: self.num,
                count: *count,
                index: *index,
                data: data.clone(),
            }),
            Meat::Ack(_) => None,
        }
    }

    pub fn to_noun(&self) -> Noun {
        let meat = match &self.meat {
            Meat::Fragment { count, index, data } => Noun::tuple(0u64.into(), &[
                (*count as u64).into(),
                (*index as u64).into(),
                data.clone().into(),
            ]),
            Meat::Ack(Ack::Fragment(index)) => Noun::tuple(1u64.into(), &[0u64.into(), (*index as u64).into()]),
            Meat::Ack(Ack::Message { ok, lag }) => Noun::tuple(1u64.into(), &[
                1u64.into(),
                // loobean: 0 is yes
                (if *ok { 0u64 } else { 1u64 }).into(),
                (*lag).into(),
            ]),
        };
        Noun::tuple(self.bone.into(), &[self.num.into(), meat])
    }

    pub fn from_noun(noun: &Noun) -> anyhow::Result<ShutPacket> {
        let bone = noun.head()?.as_u64()?;
        let rest = noun.tail()?;
        let num = rest.head()?.as_u64()?;
        let meat = rest.tail()?;

        let meat = match meat.head()?.as_u64()? {
            0 => {
                let rest = meat.tail()?;
                let count = rest.head()?.as_u32()?;
                let rest = rest.tail()?;
                Meat::Fragment {
                    count,
                    index: rest.head()?.as_u32()?,
                    data: rest.tail()?.as_atom()?.clone(),
                }
            }
            1 => {
                let ack = meat.tail()?;
                match ack.head()?.as_u64()? {
                    0 => Meat::Ack(Ack::Fragment(ack.tail()?.as_u32()?)),
                    1 => {
                        let rest = ack.tail()?;
                        Meat::Ack(Ack::Message {
                            ok: rest.head()?.as_u64()? == 0,
                            lag: rest.tail()?.as_u64()?,
                        })
                    }
                    other => return Err(AmesError::UnexpectedNoun(format!("unknown ack tag {}", other)).into()),
                }
            }
            other => return Err(AmesError::UnexpectedNoun(format!("unknown meat tag {}", other)).into()),
        };
        Ok(ShutPacket { bone, num, meat })
    }
}

/// Binds a ciphertext to both parties and their key revisions
fn associated_data(sndr: Ship, rcvr: Ship, sndr_life: Life, rcvr_life: Life) -> Vec<Vec<u8>> {
    vec![
        atom_bytes(&BigUint::from(sndr.0)),
        atom_bytes(&BigUint::from(rcvr.0)),
        atom_bytes(&BigUint::from(sndr_life)),
        atom_bytes(&BigUint::from(rcvr_life)),
    ]
}

fn tick(life: Life) -> u8 {
    (life % 16) as u8
}

/// Jams and encrypts a shut packet. The resulting content packs the SIV, the plaintext length
///  and the ciphertext: `iv | len << 128 | ciphertext << 144`.
pub fn encode_shut_packet(
    shut: &ShutPacket,
    key: &SymmetricKey,
    sndr: Ship,
    rcvr: Ship,
    sndr_life: Life,
    rcvr_life: Life,
    crypto: &dyn CryptoProvider,
) -> anyhow::Result<Packet> {
    let plaintext = atom_bytes(&jam(&shut.to_noun()));
    if plaintext.len() > u16::MAX as usize {
        anyhow::bail!("shut packet of {} bytes does not fit the length field", plaintext.len());
    }

    let ad = associated_data(sndr, rcvr, sndr_life, rcvr_life);
    let (iv, ciphertext) = crypto.siv_encrypt(&plaintext, &ad, &key.siv_key())?;

    let content = BigUint::from_bytes_le(&iv)
        | BigUint::from(plaintext.len()) << IV_BITS
        | BigUint::from_bytes_le(&ciphertext) << (IV_BITS + LEN_BITS);

    Ok(Packet {
        sndr,
        rcvr,
        sndr_tick: tick(sndr_life),
        rcvr_tick: tick(rcvr_life),
        origin: None,
        content,
    })
}

/// Decrypts and cues a packet's content. `sndr_life` and `rcvr_life` are the key revisions
///  this side believes in; a packet encrypted for other revisions is rejected.
pub fn decode_shut_packet(
    packet: &Packet,
    key: &SymmetricKey,
    sndr_life: Life,
    rcvr_life: Life,
    crypto: &dyn CryptoProvider,
) -> anyhow::Result<ShutPacket> {
    if packet.sndr_tick != tick(sndr_life) {
        return Err(AmesError::TickMismatch { expected: tick(sndr_life), actual: packet.sndr_tick }.into());
    }
    if packet.rcvr_tick != tick(rcvr_life) {
        return Err(AmesError::TickMismatch { expected: tick(rcvr_life), actual: packet.rcvr_tick }.into());
    }

    let iv_mask = (BigUint::one() << IV_BITS) - 1u32;
    let iv_atom = &packet.content & &iv_mask;
    let len = ((&packet.content >> IV_BITS) & BigUint::from(u16::MAX)).to_usize().unwrap_or(0);
    let cipher_atom = &packet.content >> (IV_BITS + LEN_BITS);

    if atom_bytes(&cipher_atom).len() > len {
        return Err(AmesError::Decryption(format!("ciphertext exceeds its declared length of {} bytes", len)).into());
    }

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&atom_bytes_padded(&iv_atom, 16));
    let ciphertext = atom_bytes_padded(&cipher_atom, len);

    let ad = associated_data(packet.sndr, packet.rcvr, sndr_life, rcvr_life);
    let plaintext = crypto.siv_decrypt(&ciphertext, &ad, &key.siv_key(), &iv)?;

    ShutPacket::from_noun(&cue(&BigUint::from_bytes_le(&plaintext))?)
}
