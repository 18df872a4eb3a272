//! The dense matrix multiply kernel.
//!
//! One work-item computes one cell of `C = A * B`.  The kernel takes six
//! logical arguments in a fixed order: the three dimensions `rows_a`
//! (m), `cols_b` (n) and `common` (k), then buffers A, B and C.  All
//! three buffers are flattened column-major, which gives the index
//! arithmetic
//!
//! ```text
//! C[col * rows_a + row] = sum over t of A[t * rows_a + row] * B[col * common + t]
//! ```
//!
//! The WGSL source below is what device backends compile.  [`cell`] is the
//! same computation for the host, with the same accumulation order.

use bytemuck::{Pod, Zeroable};

use crate::error::OffloadError;

/// Name of the compute entry point in [`MATMUL_WGSL`].
pub const MATMUL_ENTRY_POINT: &str = "matmul";

/// Placeholder replaced by the local group extent when the program is
/// built.
const GROUP_PLACEHOLDER: &str = "{GROUP}";

/// WGSL source of the multiply kernel.
///
/// Binding 0 carries the dimensions in argument order, bindings 1 to 3
/// the buffers A, B and C.  `common` is reserved in WGSL, so the inner
/// dimension is `common_dim` on the shader side.  `global_invocation_id.x` is the row and `.y` the
/// column, matching a global extent of `(rows_a, cols_b)`.
pub const MATMUL_WGSL: &str = r#"
struct Dims {
    rows_a: u32,
    cols_b: u32,
    common_dim: u32,
    _pad: u32,
}

@group(0) @binding(0) var<uniform> dims: Dims;
@group(0) @binding(1) var<storage, read> mat_a: array<f32>;
@group(0) @binding(2) var<storage, read> mat_b: array<f32>;
@group(0) @binding(3) var<storage, read_write> mat_c: array<f32>;

@compute @workgroup_size({GROUP}, {GROUP}, 1)
fn matmul(@builtin(global_invocation_id) gid: vec3<u32>) {
    let row = gid.x;
    let col = gid.y;

    var cell: f32 = 0.0;
    for (var t: u32 = 0u; t < dims.common_dim; t = t + 1u) {
        cell = cell + mat_a[t * dims.rows_a + row] * mat_b[col * dims.common_dim + t];
    }
    mat_c[col * dims.rows_a + row] = cell;
}
"#;

/// Kernel source plus the name of its entry point.
///
/// The source is a template; [`KernelSource::render`] produces the
/// program text for a concrete group extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSource {
    pub template: &'static str,
    pub entry_point: &'static str,
}

impl KernelSource {
    /// The built-in multiply kernel.
    pub const MATMUL: KernelSource = KernelSource {
        template: MATMUL_WGSL,
        entry_point: MATMUL_ENTRY_POINT,
    };

    /// Program text with the work-group extent filled in.
    pub fn render(&self, group: u32) -> String {
        self.template.replace(GROUP_PLACEHOLDER, &group.to_string())
    }

    /// Whether the source declares a function named after the entry
    /// point.
    pub fn declares_entry_point(&self) -> bool {
        self.template.contains(&format!("fn {}(", self.entry_point))
    }
}

impl Default for KernelSource {
    fn default() -> Self {
        Self::MATMUL
    }
}

/// The three scalar kernel arguments, laid out as the `Dims` uniform.
///
/// Field order is the binding order of the kernel's first three
/// arguments and must not be rearranged.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelDims {
    pub rows_a: u32,
    pub cols_b: u32,
    pub common: u32,
    _pad: u32,
}

impl KernelDims {
    pub fn new(rows_a: usize, cols_b: usize, common: usize) -> Result<Self, OffloadError> {
        let to_u32 = |value: usize| {
            u32::try_from(value).map_err(|_| OffloadError::InvalidPartition {
                reason: format!("dimension {value} does not fit in a 32-bit index"),
            })
        };
        Ok(Self {
            rows_a: to_u32(rows_a)?,
            cols_b: to_u32(cols_b)?,
            common: to_u32(common)?,
            _pad: 0,
        })
    }

    /// Elements of A (`rows_a * common`).
    pub fn a_len(&self) -> usize {
        self.rows_a as usize * self.common as usize
    }

    /// Elements of B (`common * cols_b`).
    pub fn b_len(&self) -> usize {
        self.common as usize * self.cols_b as usize
    }

    /// Elements of C (`rows_a * cols_b`).
    pub fn c_len(&self) -> usize {
        self.rows_a as usize * self.cols_b as usize
    }

    /// Floating point operations of one multiply: `2 * m * n * k`.
    pub fn flop_count(&self) -> u64 {
        2 * u64::from(self.rows_a) * u64::from(self.cols_b) * u64::from(self.common)
    }
}

/// Evaluate one work-item: the value of `C[col * rows_a + row]`.
///
/// Accumulates in `f32` from 0.0 in ascending `t`.
#[inline]
pub fn cell(dims: &KernelDims, a: &[f32], b: &[f32], row: usize, col: usize) -> f32 {
    let rows_a = dims.rows_a as usize;
    let common = dims.common as usize;
    let mut value = 0.0f32;
    for t in 0..common {
        value += a[t * rows_a + row] * b[col * common + t];
    }
    value
}

/// Index of the output cell written by work-item `(row, col)`.
#[inline]
pub fn output_index(dims: &KernelDims, row: usize, col: usize) -> usize {
    col * dims.rows_a as usize + row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_group_extent() {
        let src = KernelSource::MATMUL.render(8);
        assert!(src.contains("@workgroup_size(8, 8, 1)"));
        assert!(!src.contains(GROUP_PLACEHOLDER));
        assert!(src.contains("fn matmul("));
    }

    fn validate(group: u32) -> Result<(), String> {
        let src = KernelSource::MATMUL.render(group);
        let module = naga::front::wgsl::parse_str(&src).map_err(|e| e.emit_to_string(&src))?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .map_err(|e| format!("{e:?}"))?;
        Ok(())
    }

    #[test]
    fn shader_parses_and_validates() {
        for group in [1, 2, 8, crate::config::DEFAULT_GROUP_SIZE as u32] {
            if let Err(log) = validate(group) {
                panic!("kernel for group extent {group} is not valid WGSL:\n{log}");
            }
        }
    }

    #[test]
    fn shader_declares_entry_point_and_uniform_layout() {
        let src = KernelSource::MATMUL.render(4);
        let module = naga::front::wgsl::parse_str(&src).unwrap();
        let entry = module
            .entry_points
            .iter()
            .find(|ep| ep.name == MATMUL_ENTRY_POINT)
            .unwrap();
        assert_eq!(entry.stage, naga::ShaderStage::Compute);
        assert_eq!(entry.workgroup_size, [4, 4, 1]);
        let dims = module
            .types
            .iter()
            .find(|(_, ty)| ty.name.as_deref() == Some("Dims"))
            .map(|(_, ty)| &ty.inner)
            .unwrap();
        match dims {
            naga::TypeInner::Struct { members, span } => {
                assert_eq!(*span as usize, std::mem::size_of::<KernelDims>());
                let names: Vec<_> = members.iter().filter_map(|m| m.name.as_deref()).collect();
                assert_eq!(names, ["rows_a", "cols_b", "common_dim", "_pad"]);
            }
            other => panic!("Dims is not a struct: {other:?}"),
        }
    }

    #[test]
    fn source_binds_arguments_in_order() {
        let src = KernelSource::MATMUL.render(4);
        let dims = src.find("@binding(0) var<uniform> dims").unwrap();
        let a = src.find("@binding(1) var<storage, read> mat_a").unwrap();
        let b = src.find("@binding(2) var<storage, read> mat_b").unwrap();
        let c = src.find("@binding(3) var<storage, read_write> mat_c").unwrap();
        assert!(dims < a && a < b && b < c);
    }

    #[test]
    fn entry_point_detection() {
        assert!(KernelSource::MATMUL.declares_entry_point());
        let wrong = KernelSource {
            entry_point: "cl_multiplier",
            ..KernelSource::MATMUL
        };
        assert!(!wrong.declares_entry_point());
    }

    #[test]
    fn dims_layout_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<KernelDims>(), 16);
        let dims = KernelDims::new(4, 3, 2).unwrap();
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&dims));
        assert_eq!(words, &[4, 3, 2, 0]);
    }

    #[test]
    fn buffer_lengths_and_flops() {
        let dims = KernelDims::new(4, 3, 2).unwrap();
        assert_eq!(dims.a_len(), 8);
        assert_eq!(dims.b_len(), 6);
        assert_eq!(dims.c_len(), 12);
        assert_eq!(dims.flop_count(), 48);
    }

    #[test]
    fn cell_uses_column_major_indexing() {
        // A is 2x2 [[1,2],[3,4]] column-major, B is 2x1 [[10],[100]].
        let dims = KernelDims::new(2, 1, 2).unwrap();
        let a = [1.0, 3.0, 2.0, 4.0];
        let b = [10.0, 100.0];
        assert_eq!(cell(&dims, &a, &b, 0, 0), 210.0);
        assert_eq!(cell(&dims, &a, &b, 1, 0), 430.0);
        assert_eq!(output_index(&dims, 1, 0), 1);
    }

    #[test]
    fn zero_common_dimension_yields_zero() {
        let dims = KernelDims::new(2, 2, 0).unwrap();
        assert_eq!(cell(&dims, &[], &[], 1, 1), 0.0);
    }
}
