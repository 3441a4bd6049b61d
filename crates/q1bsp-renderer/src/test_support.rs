// test_support.rs — map fixtures shared by the renderer tests

use q1bsp_common::cvar::LoaderSettings;
use q1bsp_common::files::FileSystem;
use q1bsp_common::model::{BrushModel, LoadEnv};
use q1bsp_common::model_load::load_brush_model;
use q1bsp_common::testutil::BspBuilder;

/// Loads every model in the built map; index 0 is the world.
pub fn load_models(builder: BspBuilder) -> Vec<BrushModel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let fs = FileSystem::new();
    let env = LoadEnv::new(&fs, LoaderSettings::default());
    load_brush_model("maps/test.bsp", &builder.build(), 1, &env).unwrap()
}

pub fn load_world(builder: BspBuilder) -> BrushModel {
    load_models(builder).swap_remove(0)
}
