use crate::config::loader::AnalyzerConfig;
use crate::config::types::FileKind;
use crate::runtime::python::PythonRuntime;
use crate::runtime::sql::SqlRuntime;
use crate::runtime::ScriptRuntime;

pub fn runtime_for(kind: FileKind, config: &AnalyzerConfig) -> Box<dyn ScriptRuntime> {
    match kind {
        FileKind::Python => Box::new(PythonRuntime::new(config.python_interpreter.clone())),
        FileKind::Sql => Box::new(SqlRuntime::new(config.sql_runner_path())),
    }
}
