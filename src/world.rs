//! World data the synchronization pass reads from.
//!
//! The world is a square of zones, each `ZONE_SIZE_TILES` tiles on a side.
//! Every zone keeps its void/land bitmask in its own arena allocation, laid
//! out exactly as it goes on the wire. Character positions are tile
//! coordinates across the whole world.

use std::fmt;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::memory::{Allocation, Arena, ArenaError};
use crate::network::body::{ZONE_BITMASK_BYTES, ZONE_SIZE_TILES};
use crate::prelude::*;

pub const SPAWN: Coordinates = Coordinates::new(5, 5);
/// Largest world whose tile coordinates still fit in 16 bits.
pub const MAX_ZONES_PER_SIDE: u16 = (u16::MAX as usize / ZONE_SIZE_TILES) as u16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    id: CharacterId,
    name: Username,
    position: Coordinates,
}
impl Character {
    pub fn id(&self) -> CharacterId {
        self.id
    }
    pub fn name(&self) -> &Username {
        &self.name
    }
    pub fn position(&self) -> Coordinates {
        self.position
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldError {
    CharactersFull { capacity: usize },
    UnknownCharacter(CharacterId),
    OutOfBounds(Coordinates),
}
impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CharactersFull { capacity } => {
                write!(f, "character table full ({capacity} characters)")
            }
            Self::UnknownCharacter(id) => write!(f, "character {id} does not exist"),
            Self::OutOfBounds(at) => write!(f, "tile {at} is outside the world"),
        }
    }
}
impl std::error::Error for WorldError {}

pub struct World {
    zones_per_side: u16,
    zones: Vec<Allocation>,
    characters: SlotMap<Character>,
}
impl World {
    /// Generates a `zones_per_side` square world. The same seed always
    /// yields the same landscape.
    pub fn new(
        arena: &mut Arena,
        zones_per_side: u16,
        max_characters: u32,
        seed: Option<u64>,
    ) -> Result<Self, ArenaError> {
        let zones_per_side = zones_per_side.clamp(1, MAX_ZONES_PER_SIDE);
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let count = zones_per_side as usize * zones_per_side as usize;
        let mut world = Self {
            zones_per_side,
            zones: Vec::with_capacity(count),
            characters: SlotMap::with_capacity(max_characters as usize),
        };
        for _ in 0..count {
            match arena.allocate(ZONE_BITMASK_BYTES) {
                Ok(zone) => {
                    rng.fill_bytes(arena.bytes_mut(&zone));
                    world.zones.push(zone);
                }
                Err(e) => {
                    world.free(arena)?;
                    return Err(e);
                }
            }
        }
        world.set_land(arena, SPAWN);
        log::info!("generated {count} zones ({zones_per_side}x{zones_per_side})");
        Ok(world)
    }
    pub fn free(self, arena: &mut Arena) -> Result<(), ArenaError> {
        for zone in &self.zones {
            arena.free(zone.offset())?;
        }
        Ok(())
    }

    pub fn zones_per_side(&self) -> u16 {
        self.zones_per_side
    }
    /// Zone holding the tile, if the tile is inside the world.
    pub fn zone_of(&self, tile: Coordinates) -> Option<Coordinates> {
        let side = ZONE_SIZE_TILES as u16;
        let zone = Coordinates::new(tile.x / side, tile.y / side);
        (zone.x < self.zones_per_side && zone.y < self.zones_per_side).then_some(zone)
    }
    /// The allocation holding a zone's bitmask.
    pub fn zone_bitmask(&self, zone: Coordinates) -> Option<&Allocation> {
        if zone.x >= self.zones_per_side || zone.y >= self.zones_per_side {
            return None;
        }
        self.zones.get(zone.y as usize * self.zones_per_side as usize + zone.x as usize)
    }
    pub fn is_land(&self, arena: &Arena, tile: Coordinates) -> bool {
        let Some(bitmask) = self.zone_of(tile).and_then(|z| self.zone_bitmask(z)) else {
            return false;
        };
        let bit = tile_bit(tile);
        arena.bytes(bitmask)[bit / 8] & (1 << (bit % 8)) != 0
    }
    fn set_land(&self, arena: &mut Arena, tile: Coordinates) {
        if let Some(bitmask) = self.zone_of(tile).and_then(|z| self.zone_bitmask(z)) {
            let bit = tile_bit(tile);
            arena.bytes_mut(bitmask)[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn create_character(
        &mut self,
        name: Username,
        position: Coordinates,
    ) -> Result<CharacterId, WorldError> {
        if self.zone_of(position).is_none() {
            return Err(WorldError::OutOfBounds(position));
        }
        let Some(idx) = self.characters.next_idx() else {
            let capacity = self.characters.capacity();
            log::error!("cannot create character {name}: character table full ({capacity})");
            return Err(WorldError::CharactersFull { capacity });
        };
        let id = CharacterId(idx as u32);
        if self.characters.insert(Character { id, name, position }).is_err() {
            return Err(WorldError::CharactersFull { capacity: self.characters.capacity() });
        }
        log::info!("created character {id} ({name}) at {position}");
        Ok(id)
    }
    pub fn character(&self, id: CharacterId) -> Option<&Character> {
        self.characters.get(id.index())
    }
    pub fn character_count(&self) -> usize {
        self.characters.len()
    }
    /// Moves a character and returns its new zone when it crossed into one.
    pub fn move_character(
        &mut self,
        id: CharacterId,
        to: Coordinates,
    ) -> Result<Option<Coordinates>, WorldError> {
        let zone = self.zone_of(to).ok_or(WorldError::OutOfBounds(to))?;
        let from = self.character(id).ok_or(WorldError::UnknownCharacter(id))?.position;
        let crossed = self.zone_of(from) != Some(zone);
        if let Some(character) = self.characters.get_mut(id.index()) {
            character.position = to;
        }
        Ok(crossed.then_some(zone))
    }
}
impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("zones_per_side", &self.zones_per_side)
            .field("characters", &self.characters.len())
            .finish()
    }
}

fn tile_bit(tile: Coordinates) -> usize {
    let (x, y) = (tile.x as usize % ZONE_SIZE_TILES, tile.y as usize % ZONE_SIZE_TILES);
    y * ZONE_SIZE_TILES + x
}
