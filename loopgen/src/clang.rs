// clang.rs — C language fragments shared by the generated functions
//
// Every generated function has the same calling convention: an array of
// input arrays, an array of output arrays and the atomic-function table.
// Loop group functions take the key (`unsigned long j`) first.

/// Definition of the atomic-function table every generated file starts with.
pub const ATOMIC_STRUCT_DEFINITION: &str = "\
typedef struct Array {
   void* data;
   unsigned long size;
   int sparse;
   const unsigned long* idx;
   unsigned long nnz;
} Array;

struct LangCAtomicFun {
   void* libModel;
   int (*forward)(void* libModel, int atomicIndex, int q, int p, const Array tx[], Array* ty);
   int (*reverse)(void* libModel, int atomicIndex, int p, const Array tx[], const Array* ty, Array* px, const Array py[]);
};";

/// Argument names and base type of a generated C function.
#[derive(Debug, Clone)]
pub struct CLanguage<'a> {
    base_type: &'a str,
    arg_in: &'a str,
    arg_out: &'a str,
    arg_atomic: &'a str,
}

impl<'a> CLanguage<'a> {
    pub fn new(base_type: &'a str) -> Self {
        Self {
            base_type,
            arg_in: "in",
            arg_out: "out",
            arg_atomic: "atomicFun",
        }
    }

    /// Same convention, passing different input/output array names.
    pub fn with_io(&self, arg_in: &'a str, arg_out: &'a str) -> Self {
        Self {
            arg_in,
            arg_out,
            ..self.clone()
        }
    }

    pub fn args_dcl(&self) -> String {
        format!(
            "{t} const *const * {i}, {t} * const * {o}, struct LangCAtomicFun {a}",
            t = self.base_type,
            i = self.arg_in,
            o = self.arg_out,
            a = self.arg_atomic
        )
    }

    pub fn args(&self) -> String {
        format!("{}, {}, {}", self.arg_in, self.arg_out, self.arg_atomic)
    }

    /// Declaration arguments of a loop group function.
    pub fn loop_args_dcl(&self, key_name: &str) -> String {
        format!("unsigned long {}, {}", key_name, self.args_dcl())
    }
}
