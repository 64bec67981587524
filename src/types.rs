/// Rank of a participant in a process group (0-indexed).
pub type Rank = usize;

/// Scalar element types supported by cohort's collective operations.
///
/// cohort defines its own type enum so it remains
/// a standalone library usable by any Rust project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScalarType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    I8 = 3,
    U8 = 4,
    I32 = 5,
    I64 = 6,
}

impl ScalarType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            ScalarType::F32 | ScalarType::I32 => 4,
            ScalarType::F64 | ScalarType::I64 => 8,
            ScalarType::F16 => 2,
            ScalarType::I8 | ScalarType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::F16 => "f16",
            ScalarType::I8 => "i8",
            ScalarType::U8 => "u8",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Product,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Product => f.write_str("product"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host memory.
    Cpu,
    /// Accelerator memory on the given device ordinal.
    #[cfg(feature = "cuda")]
    Cuda(usize),
}

impl DeviceKind {
    pub const fn is_cpu(self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => f.write_str("cpu"),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Tensor memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Dense row-major storage.
    Strided,
    /// Coordinate-format sparse storage.
    SparseCoo,
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Strided => f.write_str("strided"),
            Layout::SparseCoo => f.write_str("sparse_coo"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_type_sizes() {
        assert_eq!(ScalarType::F32.size_in_bytes(), 4);
        assert_eq!(ScalarType::F64.size_in_bytes(), 8);
        assert_eq!(ScalarType::F16.size_in_bytes(), 2);
        assert_eq!(ScalarType::I8.size_in_bytes(), 1);
        assert_eq!(ScalarType::U8.size_in_bytes(), 1);
        assert_eq!(ScalarType::I32.size_in_bytes(), 4);
        assert_eq!(ScalarType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_scalar_type_display() {
        assert_eq!(ScalarType::F32.to_string(), "f32");
        assert_eq!(ScalarType::F16.to_string(), "f16");
        assert_eq!(ScalarType::I64.to_string(), "i64");
    }

    #[test]
    fn test_reduce_op_display() {
        assert_eq!(ReduceOp::Sum.to_string(), "sum");
        assert_eq!(ReduceOp::Product.to_string(), "product");
        assert_eq!(ReduceOp::Min.to_string(), "min");
        assert_eq!(ReduceOp::Max.to_string(), "max");
    }

    #[test]
    fn test_layout_display() {
        assert_eq!(Layout::Strided.to_string(), "strided");
        assert_eq!(Layout::SparseCoo.to_string(), "sparse_coo");
    }

    #[test]
    fn test_device_kind() {
        assert!(DeviceKind::Cpu.is_cpu());
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
    }
}
