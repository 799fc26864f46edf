use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cid::Cid;
use iroh_bitswap::Block;
use libp2p::identity::Keypair;
use multihash::{Code, MultihashDigest};
use prost::Message as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::unixfs_pb;

/// Fixed message embedded in every probe payload.
pub const PAYLOAD_MESSAGE: &str = "Antares Test Data";

/// Number of random bytes per payload.
const RANDOM_LEN: usize = 100;

/// The raw codec for CIDv1 blocks handed to upload services.
const RAW_CODEC: u64 = 0x55;

/// The content a probe publishes to the network.
///
/// Every probe generates a fresh payload, so every probe announces a CID the
/// network has never seen. That is the correlation signal: nobody can
/// legitimately ask for this CID unless the target handed it to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Random", with = "base64_bytes")]
    pub random: Vec<u8>,
    #[serde(rename = "Signature", with = "base64_bytes_opt")]
    pub signature: Option<Vec<u8>>,
}

impl Payload {
    /// Generates a new payload and signs it with the host key, binding the
    /// published content to our peer identity.
    pub fn new(key: &Keypair) -> Result<Self> {
        let mut random = vec![0u8; RANDOM_LEN];
        rand::rngs::OsRng.fill_bytes(&mut random);

        let mut payload = Payload {
            message: PAYLOAD_MESSAGE.to_string(),
            timestamp: Utc::now(),
            random,
            signature: None,
        };

        let unsigned = payload.to_json().context("marshal probe data")?;
        let signature = key.sign(&unsigned).context("sign probe data")?;
        payload.signature = Some(signature);

        Ok(payload)
    }

    /// The canonical JSON representation. Field order is fixed by the struct.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("marshal payload")
    }

    /// Wraps the JSON representation into a UnixFS file node inside a dag-pb
    /// block, the framing gateways and pinning services expect. The block is
    /// named by a CIDv0 over the wrapped bytes.
    pub fn to_block(&self) -> Result<Block> {
        let json = self.to_json()?;

        let file = unixfs_pb::Data {
            r#type: unixfs_pb::data::DataType::File as i32,
            filesize: Some(json.len() as u64),
            data: Some(json),
            blocksizes: Vec::new(),
            hash_type: None,
            fanout: None,
        };
        let node = unixfs_pb::PbNode {
            links: Vec::new(),
            data: Some(file.encode_to_vec()),
        };

        Block::from_v0_data(Bytes::from(node.encode_to_vec())).context("block from dag node")
    }

    /// The bare JSON bytes as a raw-codec CIDv1 block. Upload services take
    /// the bytes directly, no dag framing needed.
    pub fn to_raw_block(&self) -> Result<Block> {
        let json = Bytes::from(self.to_json()?);
        let digest = Code::Sha2_256.digest(&json);
        Ok(Block::new(json, Cid::new_v1(RAW_CODEC, digest)))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
