//! Error types for the substrate.

use std::fmt;

use thiserror::Error;

use crate::region::{NeuronId, RegionId};

/// Identifier named by an [`SubstrateError::InvalidReference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Region(RegionId),
    RegionName(String),
    Neuron(NeuronId),
    Synapse {
        source: NeuronId,
        destination: NeuronId,
    },
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Region(id) => write!(f, "region #{id}"),
            Reference::RegionName(name) => write!(f, "region {name:?}"),
            Reference::Neuron(id) => write!(f, "neuron #{id}"),
            Reference::Synapse {
                source,
                destination,
            } => write!(f, "synapse {source}->{destination}"),
        }
    }
}

/// Capacity-limited resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Regions,
    Neurons,
    Synapses,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Regions => "regions",
            Resource::Neurons => "neurons",
            Resource::Synapses => "synapses",
        })
    }
}

#[derive(Debug, Error)]
pub enum SubstrateError {
    /// Unknown region, neuron or synapse. Local to the call.
    #[error("invalid reference: {0}")]
    InvalidReference(Reference),

    /// Out-of-range setup parameter, or a topology change after sealing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A non-finite value was offered to the substrate.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// A checkpoint failed structural validation.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// A capacity limit was reached; existing state is untouched.
    #[error("resource exhausted: {resource} limit of {limit} reached")]
    ResourceExhausted { resource: Resource, limit: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SubstrateError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SubstrateError::Configuration(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        SubstrateError::CorruptState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SubstrateError>;
