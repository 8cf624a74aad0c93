//! Optional pipeline stages.
//!
//! Collaborators with more than one sensible implementation are traits
//! ([`UvUnwrapper`], [`MaterialValidator`], [`TextureScaler`]) so the
//! exporter can be handed substitutes.

pub mod materials;
pub mod subdivision;
pub mod textures;
pub mod uv;
pub mod validate;

pub use subdivision::SubdivisionOverrideRecord;
pub use textures::{LanczosScaler, TextureResult, TextureScaler, TextureSubstitution};
pub use uv::{AtlasUnwrapper, UvStats, UvUnwrapper};
pub use validate::{MaterialReadiness, MaterialValidator, NodeGraphValidator};
