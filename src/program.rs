// Shader pipeline - compile, link, release
//
// GLSL text is compiled at run time with naga (parse -> validate -> SPIR-V).
// "Linking" checks the two stages fit together and that the fragment
// output is bound to color slot 0, then builds the graphics pipeline and
// makes it current on the context.

use anyhow::Result;
use ash::vk;
use naga::back::spv;
use naga::front::glsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use thiserror::Error;

use crate::backend::{pipeline, shader, BoundProgram, GraphicsContext};

/// Vertex stage: corners from gl_VertexIndex
pub const VERTEX_SOURCE: &str = include_str!("../shaders/builtins.vert");

/// Fragment stage: color from gl_PrimitiveID and gl_FragCoord
pub const FRAGMENT_SOURCE: &str = include_str!("../shaders/builtins.frag");

/// Fragment output variable bound to color slot 0
pub const OUTPUT_NAME: &str = "outColor";

pub const OUTPUT_SLOT: u32 = 0;

const ENTRY_POINT: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("{stage:?} shader failed to parse: {message}")]
    Parse { stage: ShaderStage, message: String },

    #[error("{stage:?} shader failed validation: {message}")]
    Validation { stage: ShaderStage, message: String },

    #[error("{stage:?} shader could not be written as SPIR-V: {message}")]
    Codegen { stage: ShaderStage, message: String },

    #[error("expected a {expected:?} shader, got a {actual:?} shader")]
    StageMismatch {
        expected: ShaderStage,
        actual: ShaderStage,
    },

    #[error("vertex shader reads {count} vertex attributes, but no vertex buffers are bound")]
    VertexInputs { count: usize },

    #[error("fragment output `{name}` is not bound to color slot {slot} (found {found:?})")]
    UnboundOutput {
        name: String,
        slot: u32,
        found: Option<u32>,
    },
}

/// A validated shader stage and its SPIR-V, not yet on the GPU
#[derive(Debug)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub module: naga::Module,
    pub words: Vec<u32>,
}

impl CompiledShader {
    pub fn compile(stage: ShaderStage, source: &str) -> Result<Self, ShaderError> {
        let module = glsl::Frontend::default()
            .parse(&glsl::Options::from(stage.to_naga()), source)
            .map_err(|e| ShaderError::Parse {
                stage,
                message: e.to_string(),
            })?;

        let info = Validator::new(
            ValidationFlags::all(),
            Capabilities::PRIMITIVE_INDEX | Capabilities::PUSH_CONSTANT,
        )
        .validate(&module)
        .map_err(|e| ShaderError::Validation {
            stage,
            message: e.to_string(),
        })?;

        // Y is flipped by the viewport instead
        let mut options = spv::Options::default();
        options.flags.remove(spv::WriterFlags::ADJUST_COORDINATE_SPACE);

        let pipeline_options = spv::PipelineOptions {
            shader_stage: stage.to_naga(),
            entry_point: ENTRY_POINT.to_string(),
        };

        let words = spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(
            |e| ShaderError::Codegen {
                stage,
                message: e.to_string(),
            },
        )?;

        Ok(Self {
            stage,
            module,
            words,
        })
    }

    fn entry_point(&self) -> Option<&naga::EntryPoint> {
        self.module
            .entry_points
            .iter()
            .find(|ep| ep.name == ENTRY_POINT)
    }

    /// Built-in variables the stage reads
    pub fn builtin_inputs(&self) -> Vec<naga::BuiltIn> {
        self.entry_point()
            .map(|ep| {
                ep.function
                    .arguments
                    .iter()
                    .filter_map(|arg| match arg.binding {
                        Some(naga::Binding::BuiltIn(builtin)) => Some(builtin),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Inputs fed from locations (vertex attributes or varyings)
    pub fn located_inputs(&self) -> usize {
        self.entry_point()
            .map(|ep| {
                ep.function
                    .arguments
                    .iter()
                    .filter(|arg| location(arg.binding.as_ref()).is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Location the output variable `name` is written to
    pub fn output_location(&self, name: &str) -> Option<u32> {
        let result = self.entry_point()?.function.result.as_ref()?;

        match &self.module.types[result.ty].inner {
            naga::TypeInner::Struct { members, .. } => members
                .iter()
                .find(|member| member.name.as_deref() == Some(name))
                .and_then(|member| location(member.binding.as_ref())),
            _ => {
                // Single unnamed output: trust it only if the variable exists
                let declared = self
                    .module
                    .global_variables
                    .iter()
                    .any(|(_, var)| var.name.as_deref() == Some(name));
                if declared {
                    location(result.binding.as_ref())
                } else {
                    None
                }
            }
        }
    }
}

fn location(binding: Option<&naga::Binding>) -> Option<u32> {
    match binding {
        Some(naga::Binding::Location { location, .. }) => Some(*location),
        _ => None,
    }
}

/// Check a vertex/fragment pair before building a pipeline from it
pub fn check_interface(
    vertex: &CompiledShader,
    fragment: &CompiledShader,
    output: &str,
) -> Result<(), ShaderError> {
    if vertex.stage != ShaderStage::Vertex {
        return Err(ShaderError::StageMismatch {
            expected: ShaderStage::Vertex,
            actual: vertex.stage,
        });
    }
    if fragment.stage != ShaderStage::Fragment {
        return Err(ShaderError::StageMismatch {
            expected: ShaderStage::Fragment,
            actual: fragment.stage,
        });
    }

    let count = vertex.located_inputs();
    if count > 0 {
        return Err(ShaderError::VertexInputs { count });
    }

    match fragment.output_location(output) {
        Some(OUTPUT_SLOT) => Ok(()),
        found => Err(ShaderError::UnboundOutput {
            name: output.to_string(),
            slot: OUTPUT_SLOT,
            found,
        }),
    }
}

/// One compiled stage living on the GPU
pub struct Shader {
    compiled: CompiledShader,
    module: vk::ShaderModule,
}

impl Shader {
    /// Compile `source` for `stage` and upload it
    pub fn compile(context: &GraphicsContext, stage: ShaderStage, source: &str) -> Result<Self> {
        let compiled = CompiledShader::compile(stage, source)?;
        let module = shader::create_shader_module(context.device(), &compiled.words)?;

        log::info!(
            "Compiled {:?} shader ({} SPIR-V words, built-ins {:?})",
            stage,
            compiled.words.len(),
            compiled.builtin_inputs()
        );

        Ok(Self { compiled, module })
    }

    fn destroy(self, context: &GraphicsContext) {
        shader::destroy_shader_module(context.device(), self.module);
    }
}

/// A linked program: the graphics pipeline and its layout
pub struct Program {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl Program {
    /// Link `vertex` and `fragment`, binding `output` to color slot 0, and make
    /// the result current
    pub fn link(
        context: &mut GraphicsContext,
        vertex: &Shader,
        fragment: &Shader,
        output: &str,
    ) -> Result<Self> {
        check_interface(&vertex.compiled, &fragment.compiled, output)?;

        let device = context.device().clone();
        let layout = pipeline::create_pipeline_layout(&device)?;

        let pipeline = match pipeline::create_graphics_pipeline(
            &device,
            context.render_pass(),
            layout,
            context.samples(),
            vertex.module,
            fragment.module,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        context.use_program(BoundProgram { pipeline, layout });
        log::info!("Linked program, `{}` -> color slot {}", output, OUTPUT_SLOT);

        Ok(Self { pipeline, layout })
    }

    /// Delete the program and both shaders
    pub fn release(self, context: &mut GraphicsContext, vertex: Shader, fragment: Shader) -> Result<()> {
        // In-flight frames may still reference the pipeline
        context.wait_idle()?;
        context.unbind_pipeline(self.pipeline);

        let device = context.device();
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
        }
        vertex.destroy(context);
        fragment.destroy(context);

        log::info!("Released shader program");
        Ok(())
    }
}

/// The vertex shader, fragment shader and program, built and released together
pub struct ShaderPipeline {
    vertex: Shader,
    fragment: Shader,
    program: Program,
}

impl ShaderPipeline {
    /// Compile both stages and link them; the program becomes current
    pub fn build(
        context: &mut GraphicsContext,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<Self> {
        let vertex = Shader::compile(context, ShaderStage::Vertex, vertex_source)?;

        let fragment = match Shader::compile(context, ShaderStage::Fragment, fragment_source) {
            Ok(fragment) => fragment,
            Err(e) => {
                vertex.destroy(context);
                return Err(e);
            }
        };

        match Program::link(context, &vertex, &fragment, OUTPUT_NAME) {
            Ok(program) => Ok(Self {
                vertex,
                fragment,
                program,
            }),
            Err(e) => {
                vertex.destroy(context);
                fragment.destroy(context);
                Err(e)
            }
        }
    }

    pub fn release(self, context: &mut GraphicsContext) -> Result<()> {
        self.program.release(context, self.vertex, self.fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn vertex() -> CompiledShader {
        CompiledShader::compile(ShaderStage::Vertex, VERTEX_SOURCE).unwrap()
    }

    fn fragment() -> CompiledShader {
        CompiledShader::compile(ShaderStage::Fragment, FRAGMENT_SOURCE).unwrap()
    }

    #[test]
    fn both_stages_compile_to_spirv() {
        assert_eq!(vertex().words.first(), Some(&SPIRV_MAGIC));
        assert_eq!(fragment().words.first(), Some(&SPIRV_MAGIC));
    }

    #[test]
    fn vertex_stage_is_buffer_free() {
        let shader = vertex();
        assert!(shader.builtin_inputs().contains(&naga::BuiltIn::VertexIndex));
        assert_eq!(shader.located_inputs(), 0);
    }

    #[test]
    fn fragment_stage_reads_primitive_index_and_frag_coord() {
        let builtins = fragment().builtin_inputs();
        assert!(builtins.contains(&naga::BuiltIn::PrimitiveIndex));
        assert!(builtins
            .iter()
            .any(|b| matches!(b, naga::BuiltIn::Position { .. })));
    }

    #[test]
    fn out_color_is_bound_to_slot_zero() {
        let fragment = fragment();
        assert_eq!(fragment.output_location(OUTPUT_NAME), Some(OUTPUT_SLOT));
        assert_eq!(fragment.output_location("fragColor"), None);
        check_interface(&vertex(), &fragment, OUTPUT_NAME).unwrap();
    }

    #[test]
    fn linking_with_an_unknown_output_fails() {
        let err = check_interface(&vertex(), &fragment(), "fragColor").unwrap_err();
        assert!(matches!(
            err,
            ShaderError::UnboundOutput { ref name, slot: 0, found: None } if name == "fragColor"
        ));
        assert!(err.to_string().contains("fragColor"));
    }

    #[test]
    fn output_on_another_slot_is_rejected() {
        let source = "#version 450\n\
                      layout(location = 1) out vec4 outColor;\n\
                      void main() { outColor = vec4(1.0); }\n";
        let fragment = CompiledShader::compile(ShaderStage::Fragment, source).unwrap();
        let err = check_interface(&vertex(), &fragment, OUTPUT_NAME).unwrap_err();
        assert!(matches!(err, ShaderError::UnboundOutput { found: Some(1), .. }));
    }

    #[test]
    fn vertex_attributes_are_rejected() {
        let source = "#version 450\n\
                      layout(location = 0) in vec2 position;\n\
                      void main() { gl_Position = vec4(position, 0.0, 1.0); }\n";
        let vertex = CompiledShader::compile(ShaderStage::Vertex, source).unwrap();
        let err = check_interface(&vertex, &fragment(), OUTPUT_NAME).unwrap_err();
        assert!(matches!(err, ShaderError::VertexInputs { count: 1 }));
    }

    #[test]
    fn swapped_stages_are_rejected() {
        let err = check_interface(&fragment(), &vertex(), OUTPUT_NAME).unwrap_err();
        assert!(matches!(
            err,
            ShaderError::StageMismatch {
                expected: ShaderStage::Vertex,
                actual: ShaderStage::Fragment
            }
        ));
    }

    #[test]
    fn syntax_errors_are_reported_per_stage() {
        let err = CompiledShader::compile(ShaderStage::Fragment, "#version 450\nvoid main( {")
            .unwrap_err();
        assert!(matches!(
            err,
            ShaderError::Parse {
                stage: ShaderStage::Fragment,
                ..
            }
        ));
    }
}
