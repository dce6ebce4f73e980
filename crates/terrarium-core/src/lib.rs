//! Core engine for the terrarium grid ecosystem simulation.
//!
//! A square habitat of cells hosts stationary food and mobile organisms that
//! forage, collide, starve, age, and reproduce with heritable mutation. The
//! engine advances one discrete tick at a time through a fixed phase order:
//! move, collide, presence, food spawn, reproduction. Rendering is pull-based;
//! callers read a colour board per tick and feed nothing back.

use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for entities backed by a generational slot map.
    pub struct EntityId;
}

/// Energy gained by an organism for each food entity it consumes.
pub const FOOD_ENERGY: f32 = 1.0;
/// Per-channel colour step applied when a child inherits its parent's colour.
pub const COLOR_MUTATION_STEP: i16 = 10;
/// Probability that a child's aggression flag flips relative to its parent.
pub const AGGRESSION_FLIP_CHANCE: f64 = 0.1;

/// Largest possible Euclidean distance between two RGB colours (255 * sqrt 3).
const MAX_COLOR_DISTANCE: f32 = 441.672_96;

/// 8-bit RGB colour triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Construct a colour from its channels.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Euclidean distance to another colour in RGB space.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f32 {
        let dr = f32::from(self.r) - f32::from(other.r);
        let dg = f32::from(self.g) - f32::from(other.g);
        let db = f32::from(self.b) - f32::from(other.b);
        (dr * dr + dg * dg + db * db).sqrt()
    }

    /// Normalized dissimilarity to another colour, in `[0, 1]`.
    #[must_use]
    pub fn dissimilarity(self, other: Self) -> f32 {
        self.distance_to(other) / MAX_COLOR_DISTANCE
    }

    /// Copy of this colour with every channel independently nudged by
    /// [`COLOR_MUTATION_STEP`], clamped to the valid channel range.
    #[must_use]
    pub fn mutated(self, rng: &mut SmallRng) -> Self {
        let nudge = |channel: u8, rng: &mut SmallRng| -> u8 {
            let delta = if rng.random_bool(0.5) {
                COLOR_MUTATION_STEP
            } else {
                -COLOR_MUTATION_STEP
            };
            (i16::from(channel) + delta).clamp(0, 255) as u8
        };
        Self {
            r: nudge(self.r, rng),
            g: nudge(self.g, rng),
            b: nudge(self.b, rng),
        }
    }
}

/// Default food colour.
pub const FOOD_GREEN: Rgb = Rgb::new(0, 200, 0);
/// Default colour for the random-walk policy.
pub const WALKER_BLUE: Rgb = Rgb::new(0, 0, 200);
/// Default colour for the fixed-heading policy.
pub const HEADING_RED: Rgb = Rgb::new(200, 0, 0);
/// Default colour for the greedy-forage policy.
pub const FORAGER_PINK: Rgb = Rgb::new(200, 0, 200);
/// Default colour for the evolving policy.
pub const EVOLVER_GREY: Rgb = Rgb::new(127, 127, 127);
/// Default background colour for empty cells on the render board.
pub const BACKGROUND_BLACK: Rgb = Rgb::new(0, 0, 0);

/// Grid coordinate pair, always within the habitat bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Cardinal movement direction. Diagonals do not exist in this world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    /// All four cardinal directions in fixed evaluation order.
    pub const ALL: [Self; 4] = [Self::North, Self::South, Self::East, Self::West];

    /// Coordinate delta for one step in this direction.
    #[must_use]
    pub const fn delta(self) -> (i64, i64) {
        match self {
            Self::North => (0, -1),
            Self::South => (0, 1),
            Self::East => (1, 0),
            Self::West => (-1, 0),
        }
    }

    /// One step from `from`, or `None` when the step leaves a `width`-wide grid.
    #[must_use]
    pub fn step(self, from: Position, width: u32) -> Option<Position> {
        let (dx, dy) = self.delta();
        let x = i64::from(from.x) + dx;
        let y = i64::from(from.y) + dy;
        let extent = i64::from(width);
        if x < 0 || y < 0 || x >= extent || y >= extent {
            None
        } else {
            Some(Position::new(x as u32, y as u32))
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::North => 0,
            Self::South => 1,
            Self::East => 2,
            Self::West => 3,
        }
    }
}

/// Occupancy discriminator: at most one entity of each class per cell.
///
/// This is a tag, not an inheritance hierarchy; it only drives cell
/// exclusivity and dominant-colour precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeciesClass {
    Food,
    Organism,
}

impl SpeciesClass {
    /// Draw-order and perception precedence; higher values win.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Food => 0,
            Self::Organism => 1,
        }
    }
}

/// Small set of species classes observed in a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassSet(u8);

impl ClassSet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Add a class to the set.
    pub const fn insert(&mut self, class: SpeciesClass) {
        self.0 |= 1 << class.precedence();
    }

    /// Whether the set contains `class`.
    #[must_use]
    pub const fn contains(self, class: SpeciesClass) -> bool {
        self.0 & (1 << class.precedence()) != 0
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Heritable traits fixed at birth for a single organism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genome {
    /// Maximum scan distance the evolving policy scores against.
    pub sight: u16,
    /// Maximum grid steps taken per tick.
    pub speed: u16,
    /// Collision weight; the smaller of two colliding evolving organisms
    /// dies. Inert for the base variants.
    pub size: u16,
    /// Attracted to colour-dissimilar (prey-like) cells when set.
    pub aggressive: bool,
}

impl Default for Genome {
    fn default() -> Self {
        Self {
            sight: 1,
            speed: 1,
            size: 1,
            aggressive: false,
        }
    }
}

impl Genome {
    /// Child genome: each integer trait perturbed by exactly one, saturating
    /// at zero, and the aggression flag flipped with a small probability.
    #[must_use]
    pub fn offspring(self, rng: &mut SmallRng) -> Self {
        let step = |value: u16, rng: &mut SmallRng| -> u16 {
            if rng.random_bool(0.5) {
                value.saturating_add(1)
            } else {
                value.saturating_sub(1)
            }
        };
        Self {
            sight: step(self.sight, rng),
            speed: step(self.speed, rng),
            size: step(self.size, rng),
            aggressive: if rng.random_bool(AGGRESSION_FLIP_CHANCE) {
                !self.aggressive
            } else {
                self.aggressive
            },
        }
    }
}

/// Stateless discriminant for the available decision policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    RandomWalk,
    FixedHeading,
    GreedyForage,
    Evolving,
}

impl PolicyKind {
    /// Default display colour for organisms running this policy.
    #[must_use]
    pub const fn default_color(self) -> Rgb {
        match self {
            Self::RandomWalk => WALKER_BLUE,
            Self::FixedHeading => HEADING_RED,
            Self::GreedyForage => FORAGER_PINK,
            Self::Evolving => EVOLVER_GREY,
        }
    }
}

/// Decision policy plus whatever per-organism state it carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    /// Uniformly random legal step each tick.
    RandomWalk,
    /// Keeps its heading while legal, re-rolls when blocked.
    FixedHeading { heading: Direction },
    /// Steps toward the nearest visible food, stands still otherwise.
    GreedyForage,
    /// Scores directions by colour similarity and distance within sight.
    Evolving,
}

impl Policy {
    /// Fresh policy state for the given kind.
    #[must_use]
    pub const fn new(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::RandomWalk => Self::RandomWalk,
            PolicyKind::FixedHeading => Self::FixedHeading {
                heading: Direction::North,
            },
            PolicyKind::GreedyForage => Self::GreedyForage,
            PolicyKind::Evolving => Self::Evolving,
        }
    }

    /// Discriminant for this policy.
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        match self {
            Self::RandomWalk => PolicyKind::RandomWalk,
            Self::FixedHeading { .. } => PolicyKind::FixedHeading,
            Self::GreedyForage => PolicyKind::GreedyForage,
            Self::Evolving => PolicyKind::Evolving,
        }
    }
}

/// Mutable per-organism state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Organism {
    pub energy: f32,
    pub age: u32,
    pub policy: Policy,
    pub genome: Genome,
}

impl Organism {
    /// Probability of standing still this tick, growing linearly with age.
    #[must_use]
    pub fn idle_probability(&self, max_age: u32) -> f64 {
        f64::from(self.age) / f64::from(max_age.max(1))
    }

    /// Zero or more directional steps to attempt this tick.
    ///
    /// `legal` lists the adjacent directions currently open to an organism;
    /// `food_color` is the reference colour the evolving policy scores
    /// against. The fixed-heading policy mutates its stored heading here.
    pub fn decide_moves(
        &mut self,
        perception: &Perception,
        legal: &[Direction],
        food_color: Rgb,
        rng: &mut SmallRng,
    ) -> Vec<Direction> {
        match &mut self.policy {
            Policy::RandomWalk => legal.choose(rng).map(|d| vec![*d]).unwrap_or_default(),
            Policy::FixedHeading { heading } => {
                if legal.contains(heading) {
                    vec![*heading]
                } else if let Some(direction) = legal.choose(rng) {
                    *heading = *direction;
                    vec![*direction]
                } else {
                    Vec::new()
                }
            }
            Policy::GreedyForage => {
                let mut best: Option<(Direction, u32)> = None;
                for direction in Direction::ALL {
                    if !legal.contains(&direction) {
                        continue;
                    }
                    let sighting = perception.sighting(direction);
                    let Some(occupant) = &sighting.occupant else {
                        continue;
                    };
                    if !occupant.classes.contains(SpeciesClass::Food) {
                        continue;
                    }
                    if best.is_none_or(|(_, distance)| sighting.distance < distance) {
                        best = Some((direction, sighting.distance));
                    }
                }
                best.map(|(direction, _)| vec![direction]).unwrap_or_default()
            }
            Policy::Evolving => {
                let sight = self.genome.sight;
                let aggressive = self.genome.aggressive;
                // Pre-shuffle so no cardinal direction systematically wins
                // score ties through evaluation order.
                let mut order = Direction::ALL;
                order.shuffle(rng);

                let mut best: Option<Direction> = None;
                let mut best_score = 0.0_f32;
                let mut shortest = u32::MAX;
                for direction in order {
                    let sighting = perception.sighting(direction);
                    if sighting.distance < shortest {
                        shortest = sighting.distance;
                    }
                    let Some(occupant) = &sighting.occupant else {
                        continue;
                    };
                    if sighting.distance > u32::from(sight) {
                        continue;
                    }
                    let dissimilarity = occupant.color.dissimilarity(food_color);
                    let color_score = if aggressive {
                        dissimilarity
                    } else {
                        1.0 - dissimilarity
                    };
                    let distance_score = if sight > 1 {
                        1.0 - (sighting.distance - 1) as f32 / f32::from(sight - 1)
                    } else {
                        1.0
                    };
                    let score = color_score + distance_score;
                    if score > best_score {
                        best_score = score;
                        best = Some(direction);
                    }
                }
                match best {
                    // A fast organism never overshoots the nearest obstacle.
                    Some(direction) => {
                        let steps = usize::from(self.genome.speed).min(shortest as usize);
                        vec![direction; steps]
                    }
                    None => Vec::new(),
                }
            }
        }
    }
}

/// Tagged entity variants sharing position and display colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityKind {
    Food,
    Organism(Organism),
}

/// A grid-resident object: stationary food or a mobile organism.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entity {
    pub position: Position,
    pub color: Rgb,
    pub kind: EntityKind,
}

impl Entity {
    /// New food entity.
    #[must_use]
    pub const fn food(position: Position, color: Rgb) -> Self {
        Self {
            position,
            color,
            kind: EntityKind::Food,
        }
    }

    /// New organism with fresh policy state and the given genome.
    #[must_use]
    pub const fn organism(
        position: Position,
        color: Rgb,
        policy: Policy,
        genome: Genome,
        starting_energy: f32,
    ) -> Self {
        Self {
            position,
            color,
            kind: EntityKind::Organism(Organism {
                energy: starting_energy,
                age: 0,
                policy,
                genome,
            }),
        }
    }

    /// Species class used for occupancy exclusivity and precedence.
    #[must_use]
    pub const fn class(&self) -> SpeciesClass {
        match self.kind {
            EntityKind::Food => SpeciesClass::Food,
            EntityKind::Organism(_) => SpeciesClass::Organism,
        }
    }

    /// Borrow the organism state, if this entity is one.
    #[must_use]
    pub const fn as_organism(&self) -> Option<&Organism> {
        match &self.kind {
            EntityKind::Organism(organism) => Some(organism),
            EntityKind::Food => None,
        }
    }
}

/// Dense entity storage with generational handles and stable iteration order.
///
/// The single source of truth for entity data; the habitat grid stores only
/// handles. Follows the slot-map-plus-dense-rows arena layout.
#[derive(Debug, Default)]
pub struct EntityArena {
    slots: SlotMap<EntityId, usize>,
    handles: Vec<EntityId>,
    entities: Vec<Entity>,
}

impl EntityArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true when no entities are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterate over live handles in dense (insertion) order.
    pub fn iter_handles(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.handles.iter().copied()
    }

    /// Returns true if `id` refers to a live entity.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(id)
    }

    /// Borrow the entity behind `id`.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots.get(id).map(|&index| &self.entities[index])
    }

    /// Mutably borrow the entity behind `id`.
    #[must_use]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.slots
            .get(id)
            .copied()
            .map(|index| &mut self.entities[index])
    }

    /// Insert a new entity and return its handle.
    pub fn insert(&mut self, entity: Entity) -> EntityId {
        let index = self.entities.len();
        self.entities.push(entity);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its entity data if it was present.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let index = self.slots.remove(id)?;
        let removed = self.entities.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }
}

/// Errors raised while constructing a simulation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a terrarium, read once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrariumConfig {
    /// Habitat edge length in cells; the grid is `width × width`.
    pub habitat_width: u32,
    /// Energy spent per executed grid step.
    pub move_cost: f32,
    /// Energy spent on a tick with no movement; also the per-point upkeep
    /// rate for the evolving policy's sight and size traits.
    pub metabolic_cost: f32,
    /// Energy every organism starts (and resets to after reproducing) with.
    pub starting_energy: f32,
    /// Energy an organism must exceed before it may reproduce.
    pub reproduction_threshold: f32,
    /// Age at which an organism dies regardless of remaining energy.
    pub max_age: u32,
    /// Per-empty-cell organism probability used when seeding the world.
    pub initial_organism_probability: f64,
    /// Per-empty-cell food probability used when seeding the world.
    pub initial_food_probability: f64,
    /// Nominal per-empty-cell food probability rolled every tick.
    pub food_spawn_probability: f64,
    /// Colour assigned to spawned food; also the evolving policy's reference.
    pub food_color: Rgb,
    /// Colour reported for empty cells on the render board.
    pub background_color: Rgb,
    /// Policy kinds sampled uniformly when seeding organisms.
    pub population_mix: Vec<PolicyKind>,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained; 0 disables history.
    pub history_capacity: usize,
}

impl Default for TerrariumConfig {
    fn default() -> Self {
        Self {
            habitat_width: 100,
            move_cost: 0.1,
            metabolic_cost: 0.01,
            starting_energy: 5.0,
            reproduction_threshold: 10.0,
            max_age: 1_000,
            initial_organism_probability: 0.01,
            initial_food_probability: 0.5,
            food_spawn_probability: 0.001,
            food_color: FOOD_GREEN,
            background_color: BACKGROUND_BLACK,
            population_mix: vec![
                PolicyKind::RandomWalk,
                PolicyKind::FixedHeading,
                PolicyKind::GreedyForage,
                PolicyKind::Evolving,
            ],
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl TerrariumConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.habitat_width == 0 {
            return Err(SimulationError::InvalidConfig(
                "habitat_width must be non-zero",
            ));
        }
        if self.move_cost < 0.0 || self.metabolic_cost < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "energy costs must be non-negative",
            ));
        }
        if self.starting_energy <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "starting_energy must be positive",
            ));
        }
        if self.reproduction_threshold < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "reproduction_threshold must be non-negative",
            ));
        }
        if self.max_age == 0 {
            return Err(SimulationError::InvalidConfig("max_age must be non-zero"));
        }
        for probability in [
            self.initial_organism_probability,
            self.initial_food_probability,
            self.food_spawn_probability,
        ] {
            if !(0.0..=1.0).contains(&probability) {
                return Err(SimulationError::InvalidConfig(
                    "spawn probabilities must lie in [0, 1]",
                ));
            }
        }
        if self.population_mix.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "population_mix must name at least one policy",
            ));
        }
        Ok(())
    }

    /// Returns a seeded RNG, drawing a seed from entropy if none is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Square grid of cells, each holding the handles of its current occupants.
///
/// Cells are transiently multi-occupant between the move and collision
/// phases; same-class co-location is rejected at move time, never here.
/// Coordinate arguments to `insert`/`remove`/`cell_contents` must be in
/// range; violations panic because they indicate grid/registry
/// desynchronization that would corrupt later ticks.
#[derive(Debug)]
pub struct Habitat {
    width: u32,
    cells: Vec<Vec<EntityId>>,
}

impl Habitat {
    /// Construct an empty `width × width` habitat.
    #[must_use]
    pub fn new(width: u32) -> Self {
        assert!(width > 0, "habitat width must be non-zero");
        Self {
            width,
            cells: vec![Vec::new(); (width as usize) * (width as usize)],
        }
    }

    /// Habitat edge length in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Total number of cells in the grid.
    #[must_use]
    pub const fn total_cells(&self) -> usize {
        (self.width as usize) * (self.width as usize)
    }

    /// Number of cells currently holding at least one entity.
    #[must_use]
    pub fn occupied_cells(&self) -> usize {
        self.cells.iter().filter(|cell| !cell.is_empty()).count()
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        assert!(
            x < self.width && y < self.width,
            "habitat coordinate ({x}, {y}) out of range"
        );
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Handles of the entities currently located at `(x, y)`.
    #[must_use]
    pub fn cell_contents(&self, x: u32, y: u32) -> &[EntityId] {
        &self.cells[self.offset(x, y)]
    }

    /// Whether `(x, y)` holds an entity of `class`; false when out of range.
    #[must_use]
    pub fn is_occupied_by_class(
        &self,
        x: u32,
        y: u32,
        class: SpeciesClass,
        arena: &EntityArena,
    ) -> bool {
        if x >= self.width || y >= self.width {
            return false;
        }
        self.cells[self.offset(x, y)].iter().any(|&id| {
            arena
                .get(id)
                .expect("habitat cell references untracked entity")
                .class()
                == class
        })
    }

    /// Register `id` at `position`.
    pub fn insert(&mut self, id: EntityId, position: Position) {
        let offset = self.offset(position.x, position.y);
        let cell = &mut self.cells[offset];
        assert!(!cell.contains(&id), "entity already registered in cell");
        cell.push(id);
    }

    /// Unregister `id` from `position`.
    pub fn remove(&mut self, id: EntityId, position: Position) {
        let offset = self.offset(position.x, position.y);
        let cell = &mut self.cells[offset];
        let index = cell
            .iter()
            .position(|&occupant| occupant == id)
            .expect("entity not present in its recorded cell");
        cell.swap_remove(index);
    }

    /// Handle of the occupant with the highest class precedence at `(x, y)`.
    #[must_use]
    pub fn dominant_entity(&self, x: u32, y: u32, arena: &EntityArena) -> Option<EntityId> {
        self.cells[self.offset(x, y)]
            .iter()
            .max_by_key(|&&id| {
                arena
                    .get(id)
                    .expect("habitat cell references untracked entity")
                    .class()
                    .precedence()
            })
            .copied()
    }

    /// Colour of the precedence-dominant occupant at `(x, y)`.
    #[must_use]
    pub fn dominant_color(&self, x: u32, y: u32, arena: &EntityArena) -> Option<Rgb> {
        self.dominant_entity(x, y, arena).map(|id| {
            arena
                .get(id)
                .expect("habitat cell references untracked entity")
                .color
        })
    }
}

/// What a scan saw in one cell: the precedence-dominant colour plus the set
/// of species classes present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occupant {
    pub color: Rgb,
    pub classes: ClassSet,
}

/// Result of scanning one cardinal direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sighting {
    /// Steps taken, starting at 1 for the adjacent cell. When nothing was
    /// found this counts up to and including the step that left the grid.
    pub distance: u32,
    /// The first non-empty cell encountered, if any.
    pub occupant: Option<Occupant>,
}

/// Line-of-sight scan outward from `origin`, one cell at a time.
///
/// Terminates at the first non-empty cell or at the grid boundary. A pure
/// query over the habitat; entities hold no reference back to it.
#[must_use]
pub fn scan(
    habitat: &Habitat,
    arena: &EntityArena,
    origin: Position,
    direction: Direction,
) -> Sighting {
    let mut cursor = origin;
    let mut distance = 0;
    loop {
        distance += 1;
        let Some(next) = direction.step(cursor, habitat.width()) else {
            return Sighting {
                distance,
                occupant: None,
            };
        };
        cursor = next;
        let contents = habitat.cell_contents(cursor.x, cursor.y);
        if contents.is_empty() {
            continue;
        }
        let mut classes = ClassSet::new();
        for &id in contents {
            classes.insert(
                arena
                    .get(id)
                    .expect("habitat cell references untracked entity")
                    .class(),
            );
        }
        let color = habitat
            .dominant_color(cursor.x, cursor.y, arena)
            .expect("non-empty cell has a dominant colour");
        return Sighting {
            distance,
            occupant: Some(Occupant { color, classes }),
        };
    }
}

/// Per-tick perception snapshot: one sighting per cardinal direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Perception {
    sightings: [Sighting; 4],
}

impl Perception {
    /// Scan all four directions from `origin`.
    #[must_use]
    pub fn capture(habitat: &Habitat, arena: &EntityArena, origin: Position) -> Self {
        Self {
            sightings: Direction::ALL.map(|direction| scan(habitat, arena, origin, direction)),
        }
    }

    /// The sighting recorded for `direction`.
    #[must_use]
    pub const fn sighting(&self, direction: Direction) -> &Sighting {
        &self.sightings[direction.index()]
    }
}

/// High level simulation clock (ticks processed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Rolled-up counters describing one completed tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub organisms: usize,
    pub food: usize,
    pub births: usize,
    pub deaths: usize,
    pub food_spawned: usize,
    pub average_energy: f32,
    pub average_age: f32,
}

/// Mean heritable traits over the current evolving-policy population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitAverages {
    pub organisms: usize,
    pub speed: f32,
    pub sight: f32,
    pub size: f32,
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

/// The simulation controller: habitat, entity arena, RNG, and tick pipeline.
pub struct Simulation {
    config: TerrariumConfig,
    tick: Tick,
    rng: SmallRng,
    entities: EntityArena,
    habitat: Habitat,
    history: VecDeque<TickSummary>,
    last_births: usize,
    last_deaths: usize,
    last_food_spawned: usize,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.tick)
            .field("habitat_width", &self.habitat.width())
            .field("entity_count", &self.entities.len())
            .finish()
    }
}

impl Simulation {
    /// Build a simulation and seed its initial population and food from the
    /// configured probabilities.
    pub fn new(config: TerrariumConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let habitat = Habitat::new(config.habitat_width);
        let history_capacity = config.history_capacity;
        let mut simulation = Self {
            config,
            tick: Tick::zero(),
            rng,
            entities: EntityArena::new(),
            habitat,
            history: VecDeque::with_capacity(history_capacity),
            last_births: 0,
            last_deaths: 0,
            last_food_spawned: 0,
        };
        simulation.seed_organisms();
        simulation.seed_food();
        Ok(simulation)
    }

    /// Execute one tick pipeline and return its summary.
    ///
    /// Phase order is fixed: move, collide, presence, food spawn,
    /// reproduction. Each phase runs to completion over the full entity set
    /// before the next begins.
    pub fn step(&mut self) -> TickSummary {
        self.last_births = 0;
        self.last_deaths = 0;
        self.last_food_spawned = 0;

        self.stage_moves();
        self.stage_collisions();
        self.stage_presence();
        self.stage_food_spawn();
        self.stage_reproduction();

        self.tick = self.tick.next();
        let summary = self.summarize();
        if self.config.history_capacity > 0 {
            if self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(summary.clone());
        }
        summary
    }

    /// Occupancy-adjusted spawn probability, always in `[0, 1]`.
    ///
    /// Scales the nominal probability by `total / free` cells so that the
    /// expected spawn density tracks free space rather than total area, and
    /// collapses to zero once no cell remains empty.
    #[must_use]
    pub fn adjusted_spawn_probability(&self, nominal: f64) -> f64 {
        let total = self.habitat.total_cells();
        let free = total - self.habitat.occupied_cells();
        if free == 0 {
            return 0.0;
        }
        (nominal * total as f64 / free as f64).min(1.0)
    }

    /// Width × width board of cell colours for an external renderer.
    ///
    /// Row-major: `board[y][x]`. Empty cells carry the background colour,
    /// occupied cells the precedence-dominant occupant's colour.
    #[must_use]
    pub fn render_board(&self) -> Vec<Vec<Rgb>> {
        let width = self.habitat.width();
        let mut board =
            vec![vec![self.config.background_color; width as usize]; width as usize];
        for y in 0..width {
            for x in 0..width {
                if let Some(color) = self.habitat.dominant_color(x, y, &self.entities) {
                    board[y as usize][x as usize] = color;
                }
            }
        }
        board
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &TerrariumConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the habitat grid.
    #[must_use]
    pub fn habitat(&self) -> &Habitat {
        &self.habitat
    }

    /// Read-only access to the entity arena.
    #[must_use]
    pub fn entities(&self) -> &EntityArena {
        &self.entities
    }

    /// Borrow a single entity.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Mutably borrow a single entity (test rigs and scenario setup).
    #[must_use]
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    /// Number of live organisms.
    #[must_use]
    pub fn organism_count(&self) -> usize {
        self.entities
            .iter_handles()
            .filter(|&id| self.class_of(id) == SpeciesClass::Organism)
            .count()
    }

    /// Number of live food entities.
    #[must_use]
    pub fn food_count(&self) -> usize {
        self.entities
            .iter_handles()
            .filter(|&id| self.class_of(id) == SpeciesClass::Food)
            .count()
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Mean heritable traits of the evolving population, if any exists.
    #[must_use]
    pub fn trait_averages(&self) -> Option<TraitAverages> {
        let mut count = 0usize;
        let mut speed = 0.0_f32;
        let mut sight = 0.0_f32;
        let mut size = 0.0_f32;
        let mut red = 0.0_f32;
        let mut green = 0.0_f32;
        let mut blue = 0.0_f32;
        for id in self.entities.iter_handles() {
            let entity = self.entities.get(id).expect("handle references live entity");
            let Some(organism) = entity.as_organism() else {
                continue;
            };
            if organism.policy.kind() != PolicyKind::Evolving {
                continue;
            }
            count += 1;
            speed += f32::from(organism.genome.speed);
            sight += f32::from(organism.genome.sight);
            size += f32::from(organism.genome.size);
            red += f32::from(entity.color.r);
            green += f32::from(entity.color.g);
            blue += f32::from(entity.color.b);
        }
        if count == 0 {
            return None;
        }
        let divisor = count as f32;
        Some(TraitAverages {
            organisms: count,
            speed: speed / divisor,
            sight: sight / divisor,
            size: size / divisor,
            red: red / divisor,
            green: green / divisor,
            blue: blue / divisor,
        })
    }

    /// Spawn a food entity at `(x, y)`, returning its handle.
    pub fn spawn_food(&mut self, x: u32, y: u32) -> EntityId {
        let color = self.config.food_color;
        self.insert_entity(Entity::food(Position::new(x, y), color))
    }

    /// Spawn an organism with default genome and colour for `kind`.
    pub fn spawn_organism(&mut self, x: u32, y: u32, kind: PolicyKind) -> EntityId {
        self.spawn_organism_with(x, y, kind, Genome::default(), kind.default_color())
    }

    /// Spawn an organism with an explicit genome and colour.
    pub fn spawn_organism_with(
        &mut self,
        x: u32,
        y: u32,
        kind: PolicyKind,
        genome: Genome,
        color: Rgb,
    ) -> EntityId {
        let starting_energy = self.config.starting_energy;
        self.insert_entity(Entity::organism(
            Position::new(x, y),
            color,
            Policy::new(kind),
            genome,
            starting_energy,
        ))
    }

    fn class_of(&self, id: EntityId) -> SpeciesClass {
        self.entities
            .get(id)
            .expect("handle references live entity")
            .class()
    }

    fn insert_entity(&mut self, entity: Entity) -> EntityId {
        let position = entity.position;
        let id = self.entities.insert(entity);
        self.habitat.insert(id, position);
        id
    }

    fn kill_entity(&mut self, id: EntityId) {
        let entity = self
            .entities
            .remove(id)
            .expect("attempted to remove untracked entity");
        self.habitat.remove(id, entity.position);
        if matches!(entity.kind, EntityKind::Organism(_)) {
            self.last_deaths += 1;
        }
    }

    /// Adjacent directions an organism could legally step into right now.
    fn legal_directions(&self, origin: Position) -> Vec<Direction> {
        let width = self.habitat.width();
        Direction::ALL
            .into_iter()
            .filter(|direction| {
                direction.step(origin, width).is_some_and(|next| {
                    !self.habitat.is_occupied_by_class(
                        next.x,
                        next.y,
                        SpeciesClass::Organism,
                        &self.entities,
                    )
                })
            })
            .collect()
    }

    /// Move phase: shuffled processing order, per-organism decision, and
    /// step-by-step execution aborting at the first illegal destination.
    fn stage_moves(&mut self) {
        let width = self.habitat.width();
        let move_cost = self.config.move_cost;
        let metabolic_cost = self.config.metabolic_cost;
        let max_age = self.config.max_age;
        let food_color = self.config.food_color;

        let mut order: Vec<EntityId> = self.entities.iter_handles().collect();
        order.shuffle(&mut self.rng);

        for id in order {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            if entity.class() != SpeciesClass::Organism {
                continue;
            }
            let origin = entity.position;
            let perception = Perception::capture(&self.habitat, &self.entities, origin);
            let legal = self.legal_directions(origin);

            let moves = {
                let entity = self
                    .entities
                    .get_mut(id)
                    .expect("move order references untracked entity");
                let EntityKind::Organism(organism) = &mut entity.kind else {
                    unreachable!("class checked above");
                };
                if organism.policy.kind() == PolicyKind::Evolving {
                    // Sight and size carry upkeep whether or not a move occurs.
                    organism.energy -= metabolic_cost
                        * f32::from(organism.genome.sight + organism.genome.size);
                }
                if self.rng.random::<f64>() < organism.idle_probability(max_age) {
                    Vec::new()
                } else {
                    organism.decide_moves(&perception, &legal, food_color, &mut self.rng)
                }
            };

            let mut steps_taken = 0usize;
            for direction in moves {
                let current = self
                    .entities
                    .get(id)
                    .expect("moving entity stays tracked")
                    .position;
                let Some(next) = direction.step(current, width) else {
                    break;
                };
                if self.habitat.is_occupied_by_class(
                    next.x,
                    next.y,
                    SpeciesClass::Organism,
                    &self.entities,
                ) {
                    break;
                }
                let energy = {
                    let entity = self
                        .entities
                        .get_mut(id)
                        .expect("moving entity stays tracked");
                    entity.position = next;
                    let EntityKind::Organism(organism) = &mut entity.kind else {
                        unreachable!("class checked above");
                    };
                    organism.energy -= move_cost;
                    organism.energy
                };
                self.habitat.remove(id, current);
                self.habitat.insert(id, next);
                steps_taken += 1;
                if energy <= 0.0 {
                    break;
                }
            }

            if steps_taken == 0 {
                let entity = self
                    .entities
                    .get_mut(id)
                    .expect("idle entity stays tracked");
                if let EntityKind::Organism(organism) = &mut entity.kind {
                    organism.energy -= metabolic_cost;
                }
            }
        }
    }

    /// Collision phase: every unordered occupant pair of every multi-occupant
    /// cell is resolved exactly once, symmetrically.
    fn stage_collisions(&mut self) {
        let width = self.habitat.width();
        for y in 0..width {
            for x in 0..width {
                if self.habitat.cell_contents(x, y).len() < 2 {
                    continue;
                }
                // Snapshot so removals cannot disturb pair iteration.
                let occupants: Vec<EntityId> = self.habitat.cell_contents(x, y).to_vec();
                for first in 0..occupants.len() {
                    for second in (first + 1)..occupants.len() {
                        let a = occupants[first];
                        let b = occupants[second];
                        if !self.entities.contains(a) || !self.entities.contains(b) {
                            continue;
                        }
                        let a_survives = self.collision_outcome(a, b);
                        let b_survives = self.collision_outcome(b, a);
                        if !a_survives {
                            self.kill_entity(a);
                        }
                        if !b_survives {
                            self.kill_entity(b);
                        }
                    }
                }
            }
        }
    }

    /// One side of a symmetric collision: whether `me` survives meeting
    /// `other`, applying any energy transfer to `me`.
    ///
    /// Size contests are exclusive to the evolving variant; a pair with a
    /// base-variant member always mutually survives, and no energy moves.
    fn collision_outcome(&mut self, me: EntityId, other: EntityId) -> bool {
        let (other_class, other_contests, other_size, other_energy) = {
            let entity = self
                .entities
                .get(other)
                .expect("collision pair references untracked entity");
            match &entity.kind {
                EntityKind::Food => (SpeciesClass::Food, false, 0_u16, 0.0_f32),
                EntityKind::Organism(organism) => (
                    SpeciesClass::Organism,
                    organism.policy.kind() == PolicyKind::Evolving,
                    organism.genome.size,
                    organism.energy,
                ),
            }
        };
        let entity = self
            .entities
            .get_mut(me)
            .expect("collision pair references untracked entity");
        match &mut entity.kind {
            EntityKind::Food => other_class != SpeciesClass::Organism,
            EntityKind::Organism(organism) => match other_class {
                SpeciesClass::Food => {
                    organism.energy += FOOD_ENERGY;
                    true
                }
                SpeciesClass::Organism => {
                    if organism.policy.kind() != PolicyKind::Evolving || !other_contests {
                        return true;
                    }
                    if organism.genome.size > other_size {
                        // Winner absorbs the loser's remaining energy.
                        organism.energy += other_energy;
                        true
                    } else {
                        organism.genome.size == other_size
                    }
                }
            },
        }
    }

    /// Presence phase: organisms age and die of old age or starvation; food
    /// persists until eaten.
    fn stage_presence(&mut self) {
        let max_age = self.config.max_age;
        let handles: Vec<EntityId> = self.entities.iter_handles().collect();
        for id in handles {
            let present = {
                let entity = self
                    .entities
                    .get_mut(id)
                    .expect("presence check references untracked entity");
                match &mut entity.kind {
                    EntityKind::Food => true,
                    EntityKind::Organism(organism) => {
                        organism.age += 1;
                        organism.age < max_age && organism.energy > 0.0
                    }
                }
            };
            if !present {
                self.kill_entity(id);
            }
        }
    }

    /// Resource spawn phase: roll the occupancy-adjusted food probability
    /// against every empty cell.
    fn stage_food_spawn(&mut self) {
        let spots = self.roll_spawn_positions(self.config.food_spawn_probability);
        let color = self.config.food_color;
        self.last_food_spawned = spots.len();
        for position in spots {
            self.insert_entity(Entity::food(position, color));
        }
    }

    /// Reproduction phase: each organism over the energy threshold places one
    /// child in a uniformly chosen legal adjacent cell. Evolving children
    /// mutate; base-variant children are copies.
    fn stage_reproduction(&mut self) {
        let width = self.habitat.width();
        let threshold = self.config.reproduction_threshold;
        let starting_energy = self.config.starting_energy;
        let handles: Vec<EntityId> = self.entities.iter_handles().collect();
        for id in handles {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            let EntityKind::Organism(organism) = &entity.kind else {
                continue;
            };
            if organism.energy <= threshold {
                continue;
            }
            let parent_position = entity.position;
            let parent_color = entity.color;
            let parent_genome = organism.genome;
            let parent_kind = organism.policy.kind();

            // No legal adjacent cell: the attempt fails and the parent keeps
            // its energy.
            let legal = self.legal_directions(parent_position);
            let Some(direction) = legal.choose(&mut self.rng).copied() else {
                continue;
            };
            let child_position = direction
                .step(parent_position, width)
                .expect("legal direction stays in bounds");
            // Only the evolving variant carries heritable traits; base
            // variants breed exact copies.
            let (child_genome, child_color) = if parent_kind == PolicyKind::Evolving {
                (
                    parent_genome.offspring(&mut self.rng),
                    parent_color.mutated(&mut self.rng),
                )
            } else {
                (parent_genome, parent_color)
            };

            {
                let entity = self
                    .entities
                    .get_mut(id)
                    .expect("reproducing entity stays tracked");
                let EntityKind::Organism(organism) = &mut entity.kind else {
                    unreachable!("kind checked above");
                };
                organism.energy = starting_energy;
            }
            self.insert_entity(Entity::organism(
                child_position,
                child_color,
                Policy::new(parent_kind),
                child_genome,
                starting_energy,
            ));
            self.last_births += 1;
        }
    }

    fn seed_organisms(&mut self) {
        let spots = self.roll_spawn_positions(self.config.initial_organism_probability);
        let starting_energy = self.config.starting_energy;
        for position in spots {
            let kind = *self
                .config
                .population_mix
                .choose(&mut self.rng)
                .expect("population_mix validated non-empty");
            self.insert_entity(Entity::organism(
                position,
                kind.default_color(),
                Policy::new(kind),
                Genome::default(),
                starting_energy,
            ));
        }
    }

    fn seed_food(&mut self) {
        let spots = self.roll_spawn_positions(self.config.initial_food_probability);
        let color = self.config.food_color;
        for position in spots {
            self.insert_entity(Entity::food(position, color));
        }
    }

    /// Roll the adjusted probability once per empty cell, returning the cells
    /// that won a spawn. The probability is fixed up front so spawns within
    /// the same phase do not influence each other.
    fn roll_spawn_positions(&mut self, nominal: f64) -> Vec<Position> {
        let probability = self.adjusted_spawn_probability(nominal);
        if probability <= 0.0 {
            return Vec::new();
        }
        let width = self.habitat.width();
        let mut spots = Vec::new();
        for y in 0..width {
            for x in 0..width {
                if self.habitat.cell_contents(x, y).is_empty()
                    && self.rng.random::<f64>() < probability
                {
                    spots.push(Position::new(x, y));
                }
            }
        }
        spots
    }

    fn summarize(&self) -> TickSummary {
        let mut organisms = 0usize;
        let mut food = 0usize;
        let mut energy_sum = 0.0_f32;
        let mut age_sum = 0.0_f32;
        for id in self.entities.iter_handles() {
            let entity = self.entities.get(id).expect("handle references live entity");
            match &entity.kind {
                EntityKind::Food => food += 1,
                EntityKind::Organism(organism) => {
                    organisms += 1;
                    energy_sum += organism.energy;
                    age_sum += organism.age as f32;
                }
            }
        }
        let (average_energy, average_age) = if organisms > 0 {
            (energy_sum / organisms as f32, age_sum / organisms as f32)
        } else {
            (0.0, 0.0)
        };
        TickSummary {
            tick: self.tick,
            organisms,
            food,
            births: self.last_births,
            deaths: self.last_deaths,
            food_spawned: self.last_food_spawned,
            average_energy,
            average_age,
        }
    }
}
