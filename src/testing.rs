// Shared fixtures for unit tests

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backend::{Backend, Extent, HeadlessDevice, Recorder, RecorderKind};
use crate::compiler::{CompileError, CompiledProgram, ShaderCompiler, StageKind};

pub type Device = HeadlessDevice;

pub const EXTENT: Extent = Extent {
    width: 64,
    height: 64,
};

pub fn device(backbuffers: usize) -> Arc<HeadlessDevice> {
    Arc::new(HeadlessDevice::new(EXTENT, backbuffers).unwrap())
}

pub fn slow_device(backbuffers: usize, latency: Duration) -> Arc<HeadlessDevice> {
    Arc::new(HeadlessDevice::with_latency(EXTENT, backbuffers, latency).unwrap())
}

/// Latch a device fault by resetting a recorder that is still in flight.
/// Every later device call on `device` fails.
pub fn lose_device(device: &HeadlessDevice) {
    let mut recorder = device.create_recorder(RecorderKind::Upload).unwrap();
    device.hold_queue();
    recorder.reset().unwrap();
    recorder.close().unwrap();
    device.submit(&mut recorder).unwrap();
    assert!(recorder.reset().is_err());
    device.release_queue();
    assert!(device.fault().is_some());
}

/// Compiler that "compiles" the raw source bytes. A source containing
/// `#error` fails with a diagnostic.
#[derive(Clone, Default)]
pub struct SourceCompiler {
    calls: Arc<AtomicUsize>,
}

impl SourceCompiler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ShaderCompiler for SourceCompiler {
    fn compile(
        &self,
        source: &Path,
        entry_point: &str,
        stage: StageKind,
    ) -> Result<CompiledProgram, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = fs::read_to_string(source).unwrap_or_default();

        if text.contains("#error") || !text.contains(entry_point) {
            return Err(CompileError::Diagnostic {
                path: source.to_path_buf(),
                entry_point: entry_point.to_string(),
                stage,
                diagnostic: "error X3000: syntax error".to_string(),
            });
        }

        Ok(CompiledProgram {
            stage,
            entry_point: entry_point.to_string(),
            words: text.bytes().map(u32::from).collect(),
        })
    }
}

pub const GOOD_SHADER: &str = "float4 VS_main() {} float4 PS_main() {}";
pub const BROKEN_SHADER: &str = "float4 VS_main() { #error } float4 PS_main() {}";

pub fn write_shader(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("shader.hlsl");
    fs::write(&path, contents).unwrap();
    set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
    path
}

/// Replace the shader and move its timestamp forward by `seconds`.
///
/// The new file gets its timestamp before it is renamed into place, so a
/// concurrent reader never sees new contents with the old timestamp.
pub fn edit_shader(path: &Path, contents: &str, seconds: u64) {
    let before = fs::metadata(path).unwrap().modified().unwrap();
    let staged = path.with_extension("hlsl.tmp");
    fs::write(&staged, contents).unwrap();
    set_mtime(&staged, before + Duration::from_secs(seconds));
    fs::rename(&staged, path).unwrap();
}

fn set_mtime(path: &Path, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}
