//! Hand-derived prost types for the dag-pb / UnixFS framing of probe blocks.
//!
//! Only the subset needed to wrap a single small file is modelled; chunked
//! files, directories and HAMT shards are out of scope for a probe payload.

/// A dag-pb merkle node. Probe blocks never carry links.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbNode {
    #[prost(message, repeated, tag = "2")]
    pub links: ::prost::alloc::vec::Vec<PbLink>,
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint64, optional, tag = "3")]
    pub tsize: ::core::option::Option<u64>,
}

/// The UnixFS `Data` message embedded in a dag-pb node's data field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(enumeration = "data::DataType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint64, optional, tag = "3")]
    pub filesize: ::core::option::Option<u64>,
    #[prost(uint64, repeated, tag = "4")]
    pub blocksizes: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub hash_type: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub fanout: ::core::option::Option<u64>,
}

pub mod data {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum DataType {
        Raw = 0,
        Directory = 1,
        File = 2,
        Metadata = 3,
        Symlink = 4,
        HamtShard = 5,
    }
}
