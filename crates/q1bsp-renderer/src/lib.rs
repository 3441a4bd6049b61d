#![allow(dead_code, unused_variables, unused_assignments, unused_mut)]
#![allow(clippy::needless_return, clippy::too_many_arguments, clippy::collapsible_if,
         clippy::collapsible_else_if, clippy::field_reassign_with_default,
         clippy::manual_range_contains, clippy::single_match, clippy::comparison_chain,
         clippy::identity_op, clippy::float_cmp, clippy::needless_range_loop,
         clippy::type_complexity, clippy::manual_clamp, clippy::unnecessary_cast)]
// World renderer: lighting, lightmap atlas, texture chains and the scene cache

pub mod settings;
pub mod light;
pub mod lightmap;
pub mod gpu;
pub mod textures;
pub mod rsurf;
pub mod rmain;
pub mod scenecache;

#[cfg(test)]
mod test_support;
