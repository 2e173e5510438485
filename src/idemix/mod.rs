//! Idemix types used by the keyshare protocol
//!
//! Holds the issuer public key material the core trusts, the Schnorr proof
//! shapes exchanged with clients, and the historical JSON forms both sides of
//! the protocol still speak.

use std::collections::HashMap;
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Bit length of the Idemix attribute space (`l_m`).
pub const ATTRIBUTE_BITS: u64 = 256;

/// Bit length of the hashed challenge (`l_h`).
pub const CHALLENGE_BITS: u64 = 256;

/// Statistical zero-knowledge margin (`l_statzk`).
pub const STATZK_BITS: u64 = 128;

/// Keyshare secrets are drawn below `2^255`: the attribute space with one bit
/// of headroom so the client's share plus ours stays inside `l_m` bits.
pub const KEYSHARE_SECRET_BITS: u64 = ATTRIBUTE_BITS - 1;

/// Fixed serialized width of a keyshare secret.
pub const KEYSHARE_SECRET_BYTES: usize = 32;

/// Commitment randomness is drawn below `2^(l_m + l_h + l_statzk)` so the
/// response `s = w + c*m` statistically hides the secret.
pub const COMMITMENT_BITS: u64 = ATTRIBUTE_BITS + CHALLENGE_BITS + STATZK_BITS;

/// Addresses one version of an issuer's public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyIdentifier {
    pub issuer: String,
    pub counter: u32,
}

impl PublicKeyIdentifier {
    pub fn new(issuer: impl Into<String>, counter: u32) -> Self {
        Self {
            issuer: issuer.into(),
            counter,
        }
    }
}

impl fmt::Display for PublicKeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.issuer, self.counter)
    }
}

// The wire form wraps the issuer in an object for historical reasons:
// {"issuer": {"identifier": "demo.RU"}, "counter": 2}. We emit exactly that
// shape and accept the flat {"issuer": "demo.RU"} form as well.
impl Serialize for PublicKeyIdentifier {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Issuer<'a> {
            identifier: &'a str,
        }
        #[derive(Serialize)]
        struct Wire<'a> {
            issuer: Issuer<'a>,
            counter: u32,
        }
        Wire {
            issuer: Issuer {
                identifier: &self.issuer,
            },
            counter: self.counter,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKeyIdentifier {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IssuerWire {
            Nested { identifier: String },
            Flat(String),
        }
        #[derive(Deserialize)]
        struct Wire {
            issuer: IssuerWire,
            counter: u32,
        }
        let wire = Wire::deserialize(deserializer)?;
        let issuer = match wire.issuer {
            IssuerWire::Nested { identifier } => identifier,
            IssuerWire::Flat(identifier) => identifier,
        };
        Ok(Self {
            issuer,
            counter: wire.counter,
        })
    }
}

/// The subset of an Idemix issuer public key the keyshare protocol needs:
/// the RSA-group modulus and the attribute bases. The first base is the one
/// the master secret lives under, and the only one this server exponentiates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerPublicKey {
    #[serde(with = "bigint_dec")]
    pub n: BigUint,
    #[serde(with = "bigint_dec_vec")]
    pub bases: Vec<BigUint>,
}

impl IssuerPublicKey {
    pub fn new(n: BigUint, bases: Vec<BigUint>) -> Self {
        Self { n, bases }
    }

    /// The base the master-secret share is committed under.
    pub fn secret_base(&self) -> &BigUint {
        &self.bases[0]
    }
}

/// First Schnorr message for one public key: the server's share commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofPCommitment {
    /// `P = R^m mod n`, the share of the master secret under this key.
    #[serde(rename = "P", with = "bigint_dec")]
    pub p: BigUint,
    /// `W = R^w mod n` for fresh randomness `w`.
    #[serde(rename = "Pcommit", with = "bigint_dec")]
    pub p_commit: BigUint,
}

/// Completed Schnorr proof over the server's share: `(P, c, s)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofP {
    #[serde(rename = "P", with = "bigint_dec")]
    pub p: BigUint,
    #[serde(rename = "c", with = "bigint_dec")]
    pub c: BigUint,
    #[serde(rename = "s_response", with = "bigint_dec")]
    pub s_response: BigUint,
}

/// Commitments response body. Kept for protocol compatibility: the map is an
/// array of `[public_key_identifier, commitment]` pairs under key `c`, not a
/// JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofPCommitmentMap {
    #[serde(rename = "c")]
    pub commitments: Vec<(PublicKeyIdentifier, ProofPCommitment)>,
}

impl ProofPCommitmentMap {
    /// Convenience view as a lookup map (identifiers are unique per response).
    pub fn as_map(&self) -> HashMap<&PublicKeyIdentifier, &ProofPCommitment> {
        self.commitments.iter().map(|(k, v)| (k, v)).collect()
    }
}

/// Serde adapter: big integers as decimal strings on the wire, with bare JSON
/// numbers accepted on input.
pub mod bigint_dec {
    use num_bigint::BigUint;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BigUintVisitor;

        impl<'de> Visitor<'de> for BigUintVisitor {
            type Value = BigUint;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<BigUint, E> {
                BigUint::parse_bytes(v.as_bytes(), 10)
                    .ok_or_else(|| E::custom(format!("invalid big integer: {v}")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigUint, E> {
                Ok(BigUint::from(v))
            }
        }

        deserializer.deserialize_any(BigUintVisitor)
    }
}

/// Same adapter for vectors of big integers.
pub mod bigint_dec_vec {
    use num_bigint::BigUint;
    use serde::de::Error;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(values: &[BigUint], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for v in values {
            seq.serialize_element(&v.to_str_radix(10))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<BigUint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        raw.iter()
            .map(|s| {
                BigUint::parse_bytes(s.as_bytes(), 10)
                    .ok_or_else(|| D::Error::custom(format!("invalid big integer: {s}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkid_wire_shape() {
        let pkid = PublicKeyIdentifier::new("demo.RU", 2);
        let json = serde_json::to_value(&pkid).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"issuer": {"identifier": "demo.RU"}, "counter": 2})
        );

        // Nested form round-trips
        let back: PublicKeyIdentifier = serde_json::from_value(json).unwrap();
        assert_eq!(back, pkid);

        // Flat form is accepted too
        let flat: PublicKeyIdentifier =
            serde_json::from_value(serde_json::json!({"issuer": "demo.RU", "counter": 2})).unwrap();
        assert_eq!(flat, pkid);
    }

    #[test]
    fn test_commitment_map_is_array_of_pairs() {
        let map = ProofPCommitmentMap {
            commitments: vec![(
                PublicKeyIdentifier::new("demo.MO", 2),
                ProofPCommitment {
                    p: BigUint::from(17u32),
                    p_commit: BigUint::from(23u32),
                },
            )],
        };
        let json = serde_json::to_value(&map).unwrap();
        let pairs = json.get("c").unwrap().as_array().unwrap();
        assert_eq!(pairs.len(), 1);
        let pair = pairs[0].as_array().unwrap();
        assert_eq!(
            pair[0],
            serde_json::json!({"issuer": {"identifier": "demo.MO"}, "counter": 2})
        );
        assert_eq!(pair[1], serde_json::json!({"P": "17", "Pcommit": "23"}));

        let back: ProofPCommitmentMap = serde_json::from_value(json).unwrap();
        assert_eq!(back.commitments[0].1.p, BigUint::from(17u32));
    }

    #[test]
    fn test_proofp_field_names() {
        let proof = ProofP {
            p: BigUint::from(5u32),
            c: BigUint::from(7u32),
            s_response: BigUint::from(11u32),
        };
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json, serde_json::json!({"P": "5", "c": "7", "s_response": "11"}));
    }

    #[test]
    fn test_bigint_accepts_numbers() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(with = "bigint_dec")]
            v: BigUint,
        }
        let h: Holder = serde_json::from_str(r#"{"v": 12345}"#).unwrap();
        assert_eq!(h.v, BigUint::from(12345u32));
        let h: Holder = serde_json::from_str(r#"{"v": "12345"}"#).unwrap();
        assert_eq!(h.v, BigUint::from(12345u32));
    }
}
