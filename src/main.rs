// =============================================================================
// BUFFER-FREE RENDERING - two triangles from shader built-ins
// =============================================================================
//
// No vertex buffers, no index buffers. The vertex shader builds a unit
// square from gl_VertexIndex, the fragment shader colors it from
// gl_PrimitiveID (green per triangle) and gl_FragCoord (blue stripes every
// 50 pixels).
//
// FLOW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  open window + Vulkan context (800x600, D24S8, 2x MSAA)         │
// │    └── compile + link shaders (naga -> SPIR-V -> pipeline)      │
// │          └── while open:                                        │
// │                clear gray -> draw strip(4) -> display -> poll   │
// │    └── release shaders                                          │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod backend;
mod builtins;
mod config;
mod program;
mod window;

use anyhow::{Context, Result};
use backend::ContextSettings;
use config::{Config, ShaderFailurePolicy};
use program::{ShaderError, ShaderPipeline, FRAGMENT_SOURCE, VERTEX_SOURCE};
use std::fs::OpenOptions;
use window::{Event, RenderWindow, WindowSettings};

/// Neutral gray, alpha 0
const CLEAR_COLOR: [f32; 4] = [0.5, 0.5, 0.5, 0.0];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting buffer-free renderer");
    config.log_source();

    let mut window = RenderWindow::open(
        &WindowSettings::default(),
        &ContextSettings::default(),
        config.wants_validation(),
    )?;

    let pipeline = build_pipeline(&mut window, config.shaders.on_failure)?;

    // ─────────────────────────────────────────────────────────────────────────
    // FRAME LOOP
    // ─────────────────────────────────────────────────────────────────────────
    let mut frames: u64 = 0;
    while window.is_open() {
        window.clear(CLEAR_COLOR)?;
        if pipeline.is_some() {
            window.draw(builtins::STRIP_VERTEX_COUNT)?;
        }
        window.display()?;
        frames += 1;

        for event in window.poll_events() {
            match event {
                Event::Closed => log::info!("Close requested after {} frames", frames),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // CLEANUP
    // ─────────────────────────────────────────────────────────────────────────
    if let Some(pipeline) = pipeline {
        pipeline.release(window.context_mut())?;
    }

    log::info!("Exiting");
    Ok(())
}

/// Compile and link the shaders, honouring the failure policy
///
/// `None` means the loop only clears.
fn build_pipeline(
    window: &mut RenderWindow,
    policy: ShaderFailurePolicy,
) -> Result<Option<ShaderPipeline>> {
    match ShaderPipeline::build(window.context_mut(), VERTEX_SOURCE, FRAGMENT_SOURCE) {
        Ok(pipeline) => Ok(Some(pipeline)),
        Err(e) => tolerate_shader_failure(policy, e).map(|()| None),
    }
}

/// Decide whether a failed pipeline build ends the program
///
/// Under `warn`, shader errors are logged and swallowed. Errors that are not
/// shader errors are always fatal.
fn tolerate_shader_failure(policy: ShaderFailurePolicy, error: anyhow::Error) -> Result<()> {
    match (policy, error.downcast_ref::<ShaderError>()) {
        (ShaderFailurePolicy::Warn, Some(shader_error)) => {
            log::warn!("Shader build failed, drawing nothing: {}", shader_error);
            Ok(())
        }
        _ => Err(error.context("Failed to build shader pipeline")),
    }
}

/// Initialize logging, optionally to a file instead of stderr
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.get_log_level());
    // RUST_LOG wins over the config file
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use program::ShaderStage;

    fn shader_error() -> anyhow::Error {
        ShaderError::StageMismatch {
            expected: ShaderStage::Vertex,
            actual: ShaderStage::Fragment,
        }
        .into()
    }

    #[test]
    fn warn_policy_swallows_shader_errors() {
        assert!(tolerate_shader_failure(ShaderFailurePolicy::Warn, shader_error()).is_ok());
    }

    #[test]
    fn abort_policy_propagates_shader_errors() {
        let err = tolerate_shader_failure(ShaderFailurePolicy::Abort, shader_error()).unwrap_err();
        assert!(err.downcast_ref::<ShaderError>().is_some());
        assert!(format!("{:#}", err).contains("Failed to build shader pipeline"));
    }

    #[test]
    fn other_errors_are_fatal_even_under_warn() {
        let err = tolerate_shader_failure(
            ShaderFailurePolicy::Warn,
            anyhow::anyhow!("device lost"),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("device lost"));
    }
}
