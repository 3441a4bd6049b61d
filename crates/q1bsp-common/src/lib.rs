#![allow(dead_code, unused_variables, unused_assignments, unused_mut)]
#![allow(clippy::needless_return, clippy::too_many_arguments, clippy::collapsible_if,
         clippy::collapsible_else_if, clippy::field_reassign_with_default,
         clippy::manual_range_contains, clippy::single_match, clippy::comparison_chain,
         clippy::identity_op, clippy::float_cmp, clippy::needless_range_loop,
         clippy::type_complexity, clippy::manual_clamp, clippy::unnecessary_cast)]

pub mod q_shared;
pub mod qfiles;
pub mod crc;
pub mod error;
pub mod cvar;
pub mod common;
pub mod files;
pub mod bspfile;
pub mod model;
pub mod model_texture;
pub mod model_load;
pub mod lightgrid;
pub mod cmodel;
pub mod pmove;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
