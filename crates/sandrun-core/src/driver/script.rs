//! Script mode: evaluate a Rhai payload against the dataset.
//!
//! The engine starts raw and only receives the packages listed in
//! `build_engine`. Nothing reaches the file system except `save_artifact`,
//! which is confined to the output directory.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage,
    MoreStringPackage, Package,
};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope, INT};
use serde_json::Value;

use crate::dataset::{Cell, Table};
use crate::output::BoundedBuffer;
use crate::protocol::{ResultProtocol, ARTIFACT_EXTENSIONS, DATASET_VARIABLE, RETURN_VARIABLE};

const STDOUT_LIMIT: usize = 1024 * 1024;
const MAX_ARTIFACT_NAME: usize = 128;

/// The dataset as seen by a script.
#[derive(Debug, Clone)]
pub struct TableHandle(Rc<Table>);

impl TableHandle {
    fn row_map(&self, row: &[Cell]) -> Map {
        let mut map = Map::new();
        for (name, cell) in self.0.columns.iter().zip(row) {
            map.insert(name.as_str().into(), cell_to_dynamic(cell));
        }
        map
    }

    fn rows(&self, limit: usize) -> Array {
        self.0
            .rows
            .iter()
            .take(limit)
            .map(|row| Dynamic::from_map(self.row_map(row)))
            .collect()
    }

    fn to_json(&self) -> Value {
        let records = self
            .0
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .0
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(name, cell)| (name.clone(), cell.to_json()))
                    .collect();
                Value::Object(object)
            })
            .collect();
        Value::Array(records)
    }

    fn describe(&self) -> String {
        format!(
            "Table({} rows x {} columns: {})",
            self.0.len(),
            self.0.columns.len(),
            self.0.columns.join(", ")
        )
    }
}

fn cell_to_dynamic(cell: &Cell) -> Dynamic {
    match cell {
        Cell::Null => Dynamic::UNIT,
        Cell::Bool(b) => Dynamic::from_bool(*b),
        Cell::Int(i) => Dynamic::from_int(*i),
        Cell::Float(f) => Dynamic::from_float(*f),
        Cell::Text(s) => Dynamic::from(s.clone()),
    }
}

fn build_engine(out_dir: PathBuf, stdout: Rc<RefCell<BoundedBuffer>>) -> Engine {
    let mut engine = Engine::new_raw();

    CorePackage::new().register_into_engine(&mut engine);
    LogicPackage::new().register_into_engine(&mut engine);
    BasicArrayPackage::new().register_into_engine(&mut engine);
    BasicMapPackage::new().register_into_engine(&mut engine);
    BasicMathPackage::new().register_into_engine(&mut engine);
    MoreStringPackage::new().register_into_engine(&mut engine);

    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 32);

    let sink = Rc::clone(&stdout);
    engine.on_print(move |text| {
        let mut buffer = sink.borrow_mut();
        buffer.push_str(text);
        buffer.push_str("\n");
    });
    let sink = stdout;
    engine.on_debug(move |text, _source, _pos| {
        let mut buffer = sink.borrow_mut();
        buffer.push_str(text);
        buffer.push_str("\n");
    });

    engine
        .register_type_with_name::<TableHandle>("Table")
        .register_get("columns", |t: &mut TableHandle| -> Array {
            t.0.columns.iter().map(|c| Dynamic::from(c.clone())).collect()
        })
        .register_get("rows", |t: &mut TableHandle| -> Array { t.rows(usize::MAX) })
        .register_fn("len", |t: &mut TableHandle| -> INT { t.0.len() as INT })
        .register_fn("head", |t: &mut TableHandle, n: INT| -> Array {
            t.rows(n.max(0) as usize)
        })
        .register_fn(
            "column",
            |t: &mut TableHandle, name: &str| -> Result<Array, Box<EvalAltResult>> {
                let index = t
                    .0
                    .column_index(name)
                    .ok_or_else(|| format!("no column named '{}'", name))?;
                Ok(t.0
                    .rows
                    .iter()
                    .map(|row| row.get(index).map(cell_to_dynamic).unwrap_or(Dynamic::UNIT))
                    .collect())
            },
        )
        .register_fn("to_string", |t: &mut TableHandle| t.describe())
        .register_fn("to_debug", |t: &mut TableHandle| t.describe());

    engine.register_fn(
        "save_artifact",
        move |name: &str, content: &str| -> Result<(), Box<EvalAltResult>> {
            let file_name = validate_artifact_name(name)?;
            fs::write(out_dir.join(file_name), content)
                .map_err(|e| format!("save_artifact('{}') failed: {}", name, e).into())
        },
    );

    engine
}

fn validate_artifact_name(name: &str) -> Result<&str, String> {
    if name.is_empty() || name.len() > MAX_ARTIFACT_NAME {
        return Err(format!("invalid artifact name '{}'", name));
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(format!("artifact name '{}' must be a plain file name", name));
    }
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ARTIFACT_EXTENSIONS.contains(&extension.as_str()) {
        return Err(format!(
            "artifact '{}' must have one of the extensions: {}",
            name,
            ARTIFACT_EXTENSIONS.join(", ")
        ));
    }
    Ok(name)
}

/// Image files present in `out_dir`, sorted by name.
pub fn collect_artifacts(out_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(out_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| validate_artifact_name(name).is_ok())
            .collect(),
        Err(e) => {
            log::warn!("Cannot list output directory {}: {}", out_dir.display(), e);
            Vec::new()
        }
    };
    names.sort();
    names
}

fn return_value(value: Dynamic) -> Result<Option<Value>, String> {
    if value.is_unit() {
        return Ok(None);
    }
    if let Some(table) = value.clone().try_cast::<TableHandle>() {
        return Ok(Some(table.to_json()));
    }
    rhai::serde::from_dynamic::<Value>(&value)
        .map(|v| Some(v).filter(|v| !v.is_null()))
        .map_err(|e| format!("{} is not JSON-serializable: {}", RETURN_VARIABLE, e))
}

pub fn run_script(code: &str, table: Table, out_dir: &Path) -> ResultProtocol {
    let stdout = Rc::new(RefCell::new(BoundedBuffer::new(STDOUT_LIMIT)));
    let engine = build_engine(out_dir.to_path_buf(), Rc::clone(&stdout));

    let mut scope = Scope::new();
    scope.push_constant(DATASET_VARIABLE, TableHandle(Rc::new(table)));
    scope.push_dynamic(RETURN_VARIABLE, Dynamic::UNIT);

    let mut error = match engine.run_with_scope(&mut scope, code) {
        Ok(()) => String::new(),
        Err(err) => format!("ScriptError: {}", err),
    };

    let return_obj = match scope.get_value::<Dynamic>(RETURN_VARIABLE) {
        Some(value) => match return_value(value) {
            Ok(value) => value,
            Err(message) => {
                if error.is_empty() {
                    error = message;
                }
                None
            }
        },
        None => None,
    };

    drop(engine);
    let stdout = Rc::try_unwrap(stdout)
        .map(|cell| cell.into_inner())
        .unwrap_or_else(|shared| shared.borrow().clone())
        .into_string();

    ResultProtocol {
        stdout,
        error,
        return_obj,
        plots: collect_artifacts(out_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_table() -> Table {
        Table {
            columns: vec!["city".into(), "population".into(), "area".into()],
            rows: vec![
                vec![Cell::Text("Paris".into()), Cell::Int(2_148_000), Cell::Float(105.4)],
                vec![Cell::Text("Lyon".into()), Cell::Int(513_000), Cell::Float(47.87)],
                vec![Cell::Text("Nice".into()), Cell::Null, Cell::Float(71.92)],
            ],
        }
    }

    fn run(code: &str) -> (ResultProtocol, tempfile::TempDir) {
        let out = tempdir().unwrap();
        let result = run_script(code, sample_table(), out.path());
        (result, out)
    }

    #[test]
    fn test_prints_are_captured() {
        let (result, _out) = run(r#"print("rows: " + df.len()); print(df.columns);"#);
        assert_eq!(result.error, "");
        assert!(result.stdout.starts_with("rows: 3\n"));
        assert!(result.stdout.contains("city"));
    }

    #[test]
    fn test_return_value_round_trip() {
        let (result, _out) = run(
            r#"
            output_data = #{
                count: df.len(),
                names: df.column("city"),
                nested: [1, [2.5, "x"], #{ ok: true }],
                missing: ()
            };
            "#,
        );
        assert_eq!(result.error, "");
        assert_eq!(
            result.return_obj,
            Some(json!({
                "count": 3,
                "names": ["Paris", "Lyon", "Nice"],
                "nested": [1, [2.5, "x"], {"ok": true}],
                "missing": null
            }))
        );
    }

    #[test]
    fn test_let_binding_of_return_variable() {
        let (result, _out) = run("let output_data = 41 + 1;");
        assert_eq!(result.return_obj, Some(json!(42)));
    }

    #[test]
    fn test_no_return_value() {
        let (result, _out) = run("let x = 1;");
        assert_eq!(result.error, "");
        assert!(result.return_obj.is_none());
    }

    #[test]
    fn test_table_as_return_value() {
        let (result, _out) = run("output_data = df;");
        let value = result.return_obj.unwrap();
        assert_eq!(value.as_array().unwrap().len(), 3);
        assert_eq!(value[2]["population"], Value::Null);
    }

    #[test]
    fn test_rows_and_filtering() {
        let (result, _out) = run(
            r#"
            let big = df.rows.filter(|r| type_of(r.population) == "i64" && r.population > 1000000);
            output_data = big.map(|r| r.city);
            "#,
        );
        assert_eq!(result.error, "");
        assert_eq!(result.return_obj, Some(json!(["Paris"])));
    }

    #[test]
    fn test_fault_is_reported_with_partial_stdout() {
        let (result, _out) = run(r#"print("before"); let y = df.column("nope"); print("after");"#);
        assert!(result.error.starts_with("ScriptError"));
        assert!(result.error.contains("nope"));
        assert_eq!(result.stdout, "before\n");
    }

    #[test]
    fn test_syntax_error_is_a_fault() {
        let (result, _out) = run("let = ;");
        assert!(!result.error.is_empty());
    }

    #[test]
    fn test_eval_and_import_are_unavailable() {
        let (result, _out) = run(r#"eval("1 + 1")"#);
        assert!(!result.error.is_empty());
        let (result, _out) = run(r#"import "std" as s;"#);
        assert!(!result.error.is_empty());
    }

    #[test]
    fn test_dataset_is_constant() {
        let (result, _out) = run("df = 1;");
        assert!(!result.error.is_empty());
    }

    #[test]
    fn test_save_artifact() {
        let (result, out) = run(r#"save_artifact("chart.svg", "<svg></svg>");"#);
        assert_eq!(result.error, "");
        assert_eq!(result.plots, vec!["chart.svg".to_string()]);
        assert_eq!(
            fs::read_to_string(out.path().join("chart.svg")).unwrap(),
            "<svg></svg>"
        );
    }

    #[test]
    fn test_save_artifact_refuses_escapes() {
        for name in ["../x.svg", ".hidden.svg", "a/b.svg", "notes.txt", ""] {
            let (result, _out) = run(&format!(r#"save_artifact("{}", "x");"#, name));
            assert!(!result.error.is_empty(), "accepted {name}");
            assert!(result.plots.is_empty());
        }
    }

    #[test]
    fn test_collect_artifacts_filters_extensions() {
        let out = tempdir().unwrap();
        fs::write(out.path().join("b.png"), b"png").unwrap();
        fs::write(out.path().join("a.svg"), b"svg").unwrap();
        fs::write(out.path().join("result.json"), b"{}").unwrap();
        fs::write(out.path().join("notes.txt"), b"txt").unwrap();
        assert_eq!(collect_artifacts(out.path()), vec!["a.svg", "b.png"]);
    }
}
