use super::compiler::{compile_module, declared_precision};
use super::vm::{Machine, Module, WorkItem};
use super::{CommandQueue, Device, DeviceBuffer, Event, Precision, Sample};
use crate::error::{ComputeError, DeviceStatus, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const BINARY_MAGIC: &[u8; 4] = b"EVKB";
const BINARY_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct BinaryImage {
    fingerprint: String,
    module: Module,
}

/// A program object built for one device.
pub struct Program {
    source: String,
    fingerprint: String,
    module: Module,
    build_log: String,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("precision", &self.module.precision)
            .field("functions", &self.module.functions.len())
            .finish()
    }
}

impl Program {
    /// Compile kernel source text. Every call counts as one device compile.
    ///
    /// A rejected source yields [`ComputeError::Compile`] with the compiler
    /// log.
    pub fn compile(device: &Arc<Device>, source: &str) -> Result<Self> {
        device.record_compile();

        match compile_module(source) {
            Ok(module) => {
                let build_log = format!(
                    "montage.cl: built for {} precision, {} helper function(s), {} body op(s)",
                    module.precision,
                    module.functions.len(),
                    module.body.code.len()
                );
                Ok(Self {
                    source: source.to_string(),
                    fingerprint: device.fingerprint(),
                    module,
                    build_log,
                })
            }
            Err(diagnostic) => {
                let mut log = format!("montage.cl:{}", diagnostic);
                if let Some(line) = source.lines().nth(diagnostic.line.saturating_sub(1)) {
                    log.push('\n');
                    log.push_str(line);
                    log.push('\n');
                    log.push_str(&" ".repeat(diagnostic.column.saturating_sub(1)));
                    log.push('^');
                }
                log::debug!("Kernel build failed: {}", diagnostic);
                Err(ComputeError::Compile { log })
            }
        }
    }

    /// Rebuild a program from a binary previously exported on the same device.
    pub fn from_binary(device: &Arc<Device>, source: &str, binary: &[u8]) -> Result<Self> {
        let invalid = |why: &str| {
            ComputeError::device(DeviceStatus::InvalidBinary, format!("load program binary: {}", why))
        };

        if binary.len() < BINARY_MAGIC.len() + 1 || &binary[..4] != BINARY_MAGIC {
            return Err(invalid("bad header"));
        }
        if binary[4] != BINARY_VERSION {
            return Err(invalid("unsupported version"));
        }
        let image: BinaryImage =
            rmp_serde::from_slice(&binary[5..]).map_err(|e| invalid(&e.to_string()))?;
        if image.fingerprint != device.fingerprint() {
            return Err(invalid("built for another device"));
        }
        if declared_precision(source) != Some(image.module.precision) {
            return Err(invalid("built for another precision"));
        }

        let build_log = format!(
            "montage.cl: loaded from binary for {} precision",
            image.module.precision
        );
        Ok(Self {
            source: source.to_string(),
            fingerprint: image.fingerprint,
            module: image.module,
            build_log,
        })
    }

    /// Serialized form suitable for [`Program::from_binary`].
    pub fn binary(&self) -> Result<Vec<u8>> {
        let image = BinaryImage {
            fingerprint: self.fingerprint.clone(),
            module: self.module.clone(),
        };
        let encoded = rmp_serde::to_vec(&image)
            .map_err(|e| ComputeError::Serialization(e.to_string()))?;

        let mut binary = Vec::with_capacity(encoded.len() + 5);
        binary.extend_from_slice(BINARY_MAGIC);
        binary.push(BINARY_VERSION);
        binary.extend_from_slice(&encoded);
        Ok(binary)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn precision(&self) -> Precision {
        self.module.precision
    }

    /// Build summary of a successful compile or binary load.
    pub fn build_log(&self) -> &str {
        &self.build_log
    }
}

/// What a kernel computes for each output sample.
#[derive(Debug, Clone)]
pub enum KernelCode {
    /// `out = in(INDEX)`: output channel `i` copies input channel `i`.
    Identity,
    /// `out = in(k)` with `k` supplied at dispatch.
    Copy,
    Compiled(Arc<Program>),
}

/// Arguments bound for one montage dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MontageArgs {
    pub input_row_length: usize,
    pub input_row_offset: usize,
    pub input_channels: usize,
    pub output_row_length: usize,
    pub output_index: usize,
    pub output_copies: usize,
    /// Literal source channel of a Copy kernel.
    pub copy_source: i64,
}

impl MontageArgs {
    pub fn required_input_len(&self) -> usize {
        self.input_row_length * self.input_channels
    }

    /// Elements the output buffer must hold for this dispatch.
    pub fn required_output_len(&self) -> usize {
        (self.output_index + 1) * self.output_row_length * self.output_copies
    }
}

/// An executable montage kernel for one precision.
#[derive(Debug)]
pub struct Kernel {
    code: KernelCode,
    precision: Precision,
}

impl Kernel {
    pub fn identity(precision: Precision) -> Self {
        Self {
            code: KernelCode::Identity,
            precision,
        }
    }

    pub fn copy(precision: Precision) -> Self {
        Self {
            code: KernelCode::Copy,
            precision,
        }
    }

    pub fn compiled(program: Arc<Program>) -> Self {
        Self {
            precision: program.precision(),
            code: KernelCode::Compiled(program),
        }
    }

    pub fn code(&self) -> &KernelCode {
        &self.code
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        match &self.code {
            KernelCode::Compiled(program) => Some(program),
            _ => None,
        }
    }

    /// Enqueue a 1-D dispatch of width `args.output_row_length`.
    pub fn enqueue<T: Sample>(
        self: &Arc<Self>,
        queue: &CommandQueue,
        input: &DeviceBuffer<T>,
        output: &DeviceBuffer<T>,
        args: MontageArgs,
        positions: Arc<Vec<[f64; 3]>>,
    ) -> Result<Event> {
        if T::PRECISION != self.precision {
            return Err(ComputeError::device(
                DeviceStatus::InvalidKernelArgs,
                format!(
                    "dispatch {} kernel on {} buffers",
                    self.precision,
                    T::PRECISION
                ),
            ));
        }
        if input.same_buffer(output) {
            return Err(ComputeError::device(
                DeviceStatus::InvalidKernelArgs,
                "dispatch montage with aliased input and output",
            ));
        }
        let element = std::mem::size_of::<T>();
        ComputeError::check_size(
            "montage input",
            args.required_input_len() * element,
            input.size_bytes(),
        )?;
        ComputeError::check_size(
            "montage output",
            args.required_output_len() * element,
            output.size_bytes(),
        )?;
        if args.input_row_offset + args.output_row_length > args.input_row_length {
            return Err(ComputeError::Size {
                what: "montage input row window".to_string(),
                required: (args.input_row_offset + args.output_row_length) * element,
                actual: args.input_row_length * element,
            });
        }

        let kernel = Arc::clone(self);
        let input = input.clone();
        let output = output.clone();
        queue.submit("montage kernel", move || kernel.execute(&input, &output, args, &positions))
    }

    fn execute<T: Sample>(
        &self,
        input: &DeviceBuffer<T>,
        output: &DeviceBuffer<T>,
        args: MontageArgs,
        positions: &[[f64; 3]],
    ) -> Result<()> {
        let source = input.storage().read();
        let mut destination = output.storage().write();
        let mut machine = Machine::default();

        for sample in 0..args.output_row_length {
            let item = WorkItem {
                input: &source,
                row_length: args.input_row_length,
                row_offset: args.input_row_offset,
                channels: args.input_channels,
                positions,
                index: args.output_index as i64,
                sample,
            };
            let value = match &self.code {
                KernelCode::Identity => item.input_sample(args.output_index as i64),
                KernelCode::Copy => item.input_sample(args.copy_source),
                KernelCode::Compiled(program) => machine.run(&program.module, &item)?,
            };

            let start = (args.output_index * args.output_row_length + sample) * args.output_copies;
            destination[start..start + args.output_copies].fill(T::of(value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceOptions;

    const SOURCE: &str = "#pragma precision float\n\
                          float half(float v) { return v / 2; }\n\
                          kernel montage { out = half(in(0) + in(1)) + x(INDEX); }";

    fn device() -> Arc<Device> {
        Device::open(0, 0, &HostDeviceOptions::default()).unwrap()
    }

    fn args(output_index: usize) -> MontageArgs {
        MontageArgs {
            input_row_length: 4,
            input_row_offset: 1,
            input_channels: 2,
            output_row_length: 3,
            output_index,
            output_copies: 2,
            copy_source: 0,
        }
    }

    #[test]
    fn test_compile_failure_carries_log() {
        let device = device();
        let err = Program::compile(&device, "#pragma precision float\nkernel montage { out = ; }")
            .unwrap_err();
        match err {
            ComputeError::Compile { log } => {
                assert!(log.starts_with("montage.cl:2:"));
                assert!(log.contains('^'));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(device.compile_count(), 1);
    }

    #[test]
    fn test_binary_reload_does_not_compile() {
        let device = device();
        let program = Program::compile(&device, SOURCE).unwrap();
        let binary = program.binary().unwrap();

        let reloaded = Program::from_binary(&device, SOURCE, &binary).unwrap();
        assert_eq!(device.compile_count(), 1);
        assert_eq!(reloaded.module, program.module);
        assert!(program.build_log().starts_with("montage.cl: built for float precision"));
        assert!(reloaded.build_log().contains("loaded from binary"));

        let mut corrupted = binary.clone();
        corrupted[0] = b'X';
        assert!(Program::from_binary(&device, SOURCE, &corrupted).is_err());

        let as_double = SOURCE.replace("precision float", "precision double");
        let err = Program::from_binary(&device, &as_double, &binary).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Device {
                status: DeviceStatus::InvalidBinary,
                ..
            }
        ));
    }

    #[test]
    fn test_compiled_kernel_dispatch() {
        let device = device();
        let queue = CommandQueue::new(&device).unwrap();
        let program = Arc::new(Program::compile(&device, SOURCE).unwrap());
        let kernel = Arc::new(Kernel::compiled(program));

        let input = DeviceBuffer::<f32>::with_len(&device, 8).unwrap();
        let output = DeviceBuffer::<f32>::with_len(&device, 12).unwrap();
        queue
            .enqueue_write(&input, 0, vec![0.0, 1.0, 2.0, 3.0, 0.0, 3.0, 4.0, 5.0])
            .unwrap();

        let positions = Arc::new(vec![[10.0, 0.0, 0.0], [20.0, 0.0, 0.0]]);
        kernel
            .enqueue(&queue, &input, &output, args(1), positions)
            .unwrap();
        let result = queue.read_buffer(&output, 0, 12).unwrap();

        // (in0 + in1) / 2 + x(1) for samples 1..4, each written twice
        assert_eq!(&result[6..], &[22.0, 22.0, 23.0, 23.0, 24.0, 24.0]);
        assert_eq!(&result[..6], &[0.0; 6]);
    }

    #[test]
    fn test_precision_mismatch_is_rejected() {
        let device = device();
        let queue = CommandQueue::new(&device).unwrap();
        let kernel = Arc::new(Kernel::identity(Precision::Double));
        let input = DeviceBuffer::<f32>::with_len(&device, 8).unwrap();
        let output = DeviceBuffer::<f32>::with_len(&device, 12).unwrap();

        let err = kernel
            .enqueue(&queue, &input, &output, args(0), Arc::new(Vec::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Device {
                status: DeviceStatus::InvalidKernelArgs,
                ..
            }
        ));
    }
}
