// Shader compilation
//
// Shader sources are compiled at runtime (not in build.rs) so the pipeline
// can be rebuilt while the render loop keeps going. Compilation failures are
// ordinary values: the caller decides whether they are fatal.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Programmable pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Vertex,
    Fragment,
}

impl StageKind {
    fn glslc_name(self) -> &'static str {
        match self {
            StageKind::Vertex => "vertex",
            StageKind::Fragment => "fragment",
        }
    }
}

/// SPIR-V produced for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    pub stage: StageKind,
    pub entry_point: String,
    pub words: Vec<u32>,
}

/// Compiled program for every stage a pipeline needs
pub type StagePrograms = BTreeMap<StageKind, CompiledProgram>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to launch shader compiler `{compiler}`: {source}")]
    Launch {
        compiler: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage:?} entry `{entry_point}` in {path:?} failed to compile:\n{diagnostic}")]
    Diagnostic {
        path: PathBuf,
        entry_point: String,
        stage: StageKind,
        diagnostic: String,
    },

    #[error("compiler returned {len} bytes for {path:?}, which is not a SPIR-V module")]
    Malformed { path: PathBuf, len: usize },
}

/// Turns a source file + entry point into an executable program for `stage`
pub trait ShaderCompiler: Send + 'static {
    fn compile(
        &self,
        source: &Path,
        entry_point: &str,
        stage: StageKind,
    ) -> Result<CompiledProgram, CompileError>;
}

/// Compiles HLSL to SPIR-V with `glslc` (shipped with the Vulkan SDK)
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    executable: PathBuf,
}

impl GlslcCompiler {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(
        &self,
        source: &Path,
        entry_point: &str,
        stage: StageKind,
    ) -> Result<CompiledProgram, CompileError> {
        log::debug!("Compiling {:?} ({:?} stage, entry {})", source, stage, entry_point);

        // `-o -` writes the module to stdout so no temp files are left around
        let output = Command::new(&self.executable)
            .arg("-x")
            .arg("hlsl")
            .arg(format!("-fshader-stage={}", stage.glslc_name()))
            .arg(format!("-fentry-point={}", entry_point))
            .arg(source)
            .arg("-o")
            .arg("-")
            .output()
            .map_err(|source| CompileError::Launch {
                compiler: self.executable.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(CompileError::Diagnostic {
                path: source.to_path_buf(),
                entry_point: entry_point.to_string(),
                stage,
                diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let words = spirv_words(&output.stdout).ok_or_else(|| CompileError::Malformed {
            path: source.to_path_buf(),
            len: output.stdout.len(),
        })?;

        Ok(CompiledProgram {
            stage,
            entry_point: entry_point.to_string(),
            words,
        })
    }
}

/// Reinterpret a little-endian SPIR-V byte stream as words
fn spirv_words(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    (words[0] == SPIRV_MAGIC).then_some(words)
}
