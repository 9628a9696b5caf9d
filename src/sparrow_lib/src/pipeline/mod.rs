//! Orchestration of the analysis pipeline and module loading.
//!
//! The IR reaches this crate as the serde_json encoding of a
//! [`Module`](crate::intermediate_representation::Module), produced by an
//! external front end. The pipeline loads it, lowers it, runs the pointer
//! analysis, builds the def-use module and runs the taint analysis, and
//! collects everything into an [`AnalysisResults`](results::AnalysisResults).

use crate::intermediate_representation::Module;
use crate::prelude::*;

pub mod results;

pub use results::AnalysisResults;

/// Load and validate a serialized IR module.
pub fn load_module(path: &str) -> Result<Module> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open IR file {path}"))?;
    let module: Module = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("malformed IR module in {path}"))?;
    module
        .validate()
        .with_context(|| format!("inconsistent IR module in {path}"))?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate_representation::builder::ModuleBuilder;

    #[test]
    fn module_roundtrip_through_json() {
        let mut b = ModuleBuilder::new("roundtrip");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let slot = b.alloca(i32_ty);
        let zero = b.const_int(0);
        b.store(slot, zero);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let text = serde_json::to_string(&module).unwrap();
        let reloaded: Module = serde_json::from_str(&text).unwrap();
        reloaded.validate().unwrap();
        assert_eq!(reloaded.name, "roundtrip");
        assert_eq!(reloaded.functions.len(), 1);
    }
}
