//! Minute-grid primitives — the canonical 10,080-slot week and the smoothed
//! engagement probability surface built on top of it.

pub mod curve;
pub mod minute_grid;

pub use curve::{ContinuousCurve, SlotWeight};
pub use minute_grid::{
    datetime_to_slot, neighborhood, next_occurrence_after, slot_label, slot_to_datetime,
    week_start_of, SLOTS_PER_DAY, SLOTS_PER_WEEK,
};
