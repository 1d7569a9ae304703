//! Integration tests for the symil CLI.
//!
//! These tests invoke the `symil` binary as a subprocess and check
//! exit codes, stdout, and stderr.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[allow(deprecated)]
fn symil() -> Command {
    Command::cargo_bin("symil").unwrap()
}

const PROGRAM: &str = "\
.class M
  .field static i32 calls

  .method static i32 Abs(i32 x)
    ldarg x
    ldc.i4.0
    bge done
    ldarg x
    neg
    ret
  done:
    ldarg x
    ret
  .end

  .method static i32 Check(object o)
    ldarg o
    brtrue ok
    ldstr \"missing\"
    newobj ArgumentException::.ctor(string)
    throw
  ok:
    ldsfld M::calls
    ldc.i4.1
    add
    stsfld M::calls
    ldc.i4.1
    ret
  .end

  .method static void Spin()
  loop:
    br loop
  .end
.end
";

/// Write `text` to a file in a fresh temp dir.
fn write_program(text: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("program.il");
    fs::write(&path, text).unwrap();
    (dir, path)
}

// ---- No-args / help ----

#[test]
fn no_args_prints_usage_and_exits_1() {
    symil()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage: symil"));
}

#[test]
fn help_flag_exits_0() {
    symil()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Commands:"));
}

#[test]
fn unknown_command_exits_1() {
    symil().arg("frobnicate").assert().failure().code(1);
}

// ---- Run ----

#[test]
fn run_with_constant_argument() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Abs", "--arg", "-5"])
        .assert()
        .success()
        .stdout("result: 5\n");
}

#[test]
fn run_with_symbolic_argument() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Abs", "--arg", "?p"])
        .assert()
        .success()
        .stdout("result: ((%p < 0) ? -%p : %p)\n");
}

#[test]
fn run_prints_guarded_side_effects() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Check", "--arg", "?o"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("result: 1\n"))
        .stdout(predicate::str::contains("\n  if (%o == null): throw "))
        .stdout(predicate::str::contains(": M.calls := (%__sfld"))
        // the exception built on the throwing path still lands in the store
        .stdout(predicate::str::contains("._message = ((%o == null) ? "));
}

#[test]
fn run_with_null_argument() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Check", "--arg", "null"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("result: <throws>\n"));
}

#[test]
fn run_step_limit_exits_3() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Spin", "--max-steps", "500"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("step count exceeded limit 500"));
}

#[test]
fn run_wrong_argument_count_exits_1() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Abs"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("takes 1 argument(s), got 0"));
}

#[test]
fn run_unknown_method_exits_1() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::Nope"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no method 'M::Nope'"));
}

#[test]
fn run_missing_file_exits_1() {
    symil()
        .args(["run", "/nonexistent/program.il", "--method", "M::Abs"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn assembly_error_exits_1() {
    let (_dir, path) = write_program(".class M\n  .method static void F()\n    frobnicate\n  .end\n.end\n");
    symil()
        .arg("run")
        .arg(&path)
        .args(["--method", "M::F"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("line 3: unknown opcode 'frobnicate'"));
}

// ---- Disasm ----

#[test]
fn disasm_prints_canonical_text() {
    let (_dir, path) = write_program(PROGRAM);
    let out = symil().arg("disasm").arg(&path).assert().success();
    let text = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    assert!(text.starts_with(".class M\n  .field static i32 calls\n"));

    // canonical text is itself a valid program with the same rendering
    let (_dir2, again) = write_program(&text);
    symil()
        .arg("disasm")
        .arg(&again)
        .assert()
        .success()
        .stdout(predicate::str::diff(text));
}

#[test]
fn disasm_single_method() {
    let (_dir, path) = write_program(PROGRAM);
    symil()
        .arg("disasm")
        .arg(&path)
        .args(["--method", "M::Spin"])
        .assert()
        .success()
        .stdout("  loop:\n    br loop\n");
}
