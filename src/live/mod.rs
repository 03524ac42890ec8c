pub mod hub;
pub mod messages;
pub mod tiles;

pub use hub::{HubManager, RaceHub};
pub use messages::{ClientMessage, DeltaEntry, DeltaPayload, ServerMessage};
pub use tiles::{mercator_xy, tile_for, tiles_for_bbox, TileId};
