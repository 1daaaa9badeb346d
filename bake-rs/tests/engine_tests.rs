//! End-to-end runs over whole scripts.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use bake::config::Config;
use bake::log::{JsonLinesSink, LogState};
use bake::project::{Project, Script};
use bake::script::condition::{compare, Comparison};
use bake::script::variables::Scope;
use bake::script::{Engine, EngineOptions, Keyword, Outcome, Payload, RunStatus};

fn engine(text: &str) -> Engine {
    let mut project = Project::new();
    project.add(Script::parse("/work/main.script", text));
    Engine::new(project, EngineOptions::default())
}

#[test]
fn set_local_restores_previous_value() {
    let mut e = engine("[Process]\nSet,%Dest%,0\nSystem,SetLocal\nSet,%Dest%,1\nSystem,EndLocal\nEcho,%Dest%\n");
    let report = e.run();
    assert_eq!(e.output, vec!["0"]);
    assert_eq!(report.worst, LogState::Success);
}

#[test]
fn error_aborts_rest_of_section() {
    let mut e = engine("[Process]\nEcho,first\nFileCopy,a,b\nEcho,third\n");
    let report = e.run();
    assert_eq!(e.output, vec!["first"]);
    assert_eq!(report.worst, LogState::Error);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn error_off_downgrades_to_warning() {
    let mut e = engine("[Process]\nSystem,ErrorOff,1\nEcho,first\nFileCopy,a,b\nEcho,third\n");
    let report = e.run();
    assert_eq!(e.output, vec!["first", "third"]);
    assert_eq!(report.worst, LogState::Warning);
    assert_eq!(report.exit_code(), 0);
    assert!(e.events.iter().any(|ev| ev.message.contains("(error suppressed)")));
}

#[test]
fn error_off_covers_one_error_only() {
    let mut e = engine("[Process]\nSystem,ErrorOff\nFileCopy,a,b\nFileCopy,c,d\nEcho,never\n");
    let report = e.run();
    assert!(e.output.is_empty());
    assert_eq!(report.worst, LogState::Error);
}

#[test]
fn callee_locals_are_isolated() {
    let text = "[Process]\nSet,%L%,caller\nRun,%ScriptFile%,Sub\nEcho,[%L%][%G%][%Only%]\n\
        [Sub]\nSet,%L%,callee\nSet,%Only%,x\nSet,%G%,seen,GLOBAL\n";
    let mut e = engine(text);
    e.run();
    assert_eq!(e.output, vec!["[caller][seen][]"]);
}

#[test]
fn set_global_leaves_local_unset() {
    let seen = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&seen);
    let mut e = engine("[Process]\nSet,%Dest%,local\nSet,%Dest%,PEBakery,GLOBAL\nFileCopy,a,b\n");
    e.handlers_mut().register_fn(Keyword::FileCopy, move |_, ctx| {
        *slot.borrow_mut() = Some(ctx.get_in(Scope::Local, "Dest").map(str::to_owned));
        Outcome::success("checked")
    });
    e.run();
    assert_eq!(e.variables().get_in(Scope::Global, "Dest"), Some("PEBakery"));
    assert_eq!(*seen.borrow(), Some(None));
}

#[test]
fn version_and_hex_comparisons() {
    assert_ne!(compare("11.1", "11.1.0", false), Comparison::Equal);
    assert_ne!(compare("15", "0xF", false), Comparison::Equal);
    assert_ne!(compare("A", "A", false), Comparison::Smaller);

    let mut e = engine(
        "[Process]\nIf,11.1,Equal,11.1.0,Echo,wrong\nIf,15,Equal,0xF,Echo,wrong\nIf,A,Smaller,A,Echo,wrong\n\
         If,A,Equal,a,Echo,right\n",
    );
    e.run();
    assert_eq!(e.output, vec!["right"]);
}

#[test]
fn scripts_on_disk_call_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.script");
    fs::write(&main, "[Main]\nTitle=Main\n[Variables]\n%Who%=world\n[Process]\nRun,lib.script,Greet,%Who%\nEcho,#r\n")
        .unwrap();
    fs::write(dir.path().join("lib.script"), "[Main]\nTitle=Lib\n[Greet]\nEcho,hello #1 from %ScriptTitle%\nSet,#r,ok\n")
        .unwrap();

    let mut project = Project::new();
    project.load(&main).unwrap();
    let mut e = Engine::new(project, EngineOptions::default());
    let report = e.run();
    assert_eq!(e.output, vec!["hello world from Lib", "ok"]);
    assert_eq!(report.status, RunStatus::Done);
    assert_eq!(e.project().len(), 2);
}

#[test]
fn exist_file_and_dir() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("present.txt");
    fs::write(&file, "x").unwrap();
    let text = format!(
        "[Process]\nIf,ExistFile,{f},Echo,file\nIf,Not,ExistFile,{d}/absent.txt,Echo,no file\n\
         If,ExistDir,{d},Echo,dir\nIf,ExistDir,{f},Echo,wrong\nIf,ExistFile,{d}/pres*.TXT,Echo,glob\n",
        f = file.display(),
        d = dir.path().display(),
    );
    let mut e = engine(&text);
    e.run();
    assert_eq!(e.output, vec!["file", "no file", "dir", "glob"]);
}

#[test]
fn several_scripts_run_in_order() {
    let mut project = Project::new();
    project.add(Script::parse("/work/a.script", "[Process]\nEcho,a\nHalt,stop\n"));
    project.add(Script::parse("/work/b.script", "[Process]\nEcho,b\n"));
    let mut e = Engine::new(project, EngineOptions::default());
    let report = e.run();
    assert_eq!(e.output, vec!["a"]);
    assert_eq!(report.status, RunStatus::Halted);
    assert_eq!(report.exit_code(), 3);

    let mut project = Project::new();
    project.add(Script::parse("/work/a.script", "[Process]\nEcho,a\nExit,done\n"));
    project.add(Script::parse("/work/b.script", "[Process]\nEcho,b\n"));
    let mut e = Engine::new(project, EngineOptions::default());
    let report = e.run();
    assert_eq!(e.output, vec!["a", "b"]);
    assert_eq!(report.scripts_run, 2);
}

#[test]
fn config_drives_engine() {
    let (config, errors) = Config::load_str(
        "[engine]\nentry_section = \"Build\"\n\n[variables]\nTarget = \"X:\\\\out\"\n\n[macros]\nHello = \"Echo,Hello #1\"\n",
    );
    assert!(errors.is_empty(), "{errors:?}");
    let mut project = Project::new();
    project.add(Script::parse("/work/main.script", "[Process]\nEcho,wrong\n[Build]\nHello,%Target%\nSet,%Target%,y\n"));
    let mut e = Engine::new(project, config.engine.clone()).with_fixed(config.fixed_vars());
    for (name, command) in &config.macros {
        e.define_macro(name, command);
    }
    e.run();
    assert_eq!(e.output, vec!["Hello X:\\out"]);
    assert_eq!(e.variables().get("Target"), Some("X:\\out"));
}

#[test]
fn json_log_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.jsonl");
    let file = fs::File::create(&path).unwrap();
    let mut e = engine("[Process]\nEcho,hi\nFileCopy,a,b\n").with_sink(Box::new(JsonLinesSink::new(file)));
    e.run();
    let recorded = e.events.len();
    drop(e);

    let text = fs::read_to_string(&path).unwrap();
    let events: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(events.len(), recorded);
    assert!(events.iter().any(|ev| ev["command_keyword"] == "Echo" && ev["state"] == "Success"));
    assert!(events.iter().any(|ev| ev["command_keyword"] == "FileCopy" && ev["state"] == "Error"));
}

/// What one run looked like from the outside: keys the `IniRead` handler
/// saw, printed output and `(line, keyword, state, message)` per event.
type Observed = (Vec<String>, Vec<String>, Vec<(usize, Option<String>, LogState, String)>);

/// Run `text` with a fake `IniRead` whose value for key `Kn` is `K(n+1)`.
fn observe(text: &str, optimize: bool) -> Observed {
    let keys = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&keys);
    let mut project = Project::new();
    project.add(Script::parse("/work/main.script", text));
    let options = EngineOptions { optimize, ..EngineOptions::default() };
    let mut e = Engine::new(project, options);
    e.handlers_mut().register_fn(Keyword::IniRead, move |p, ctx| {
        let Payload::IniRead(r) = p else { return Outcome::error("not IniRead") };
        seen.borrow_mut().push(r.key.clone());
        let next = r.key.strip_prefix('K').and_then(|n| n.parse::<u32>().ok()).map(|n| format!("K{}", n + 1));
        match ctx.set_key(&r.dest, next.unwrap_or_default()) {
            Ok(()) => Outcome::success(format!("read {}", r.key)),
            Err(e) => Outcome::error(e.to_string()),
        }
    });
    e.run();
    let events = e.events.iter().map(|ev| (ev.line_no, ev.command_keyword.clone(), ev.state, ev.message.clone())).collect();
    let keys = keys.borrow().clone();
    (keys, e.output.clone(), events)
}

#[test]
fn fused_members_see_earlier_writes() {
    let text = "[Process]\nIniRead,a.ini,S,K1,%A%\nIniRead,a.ini,S,%A%,%B%\nEcho,[%A%][%B%]\n";
    let sequential = observe(text, false);
    assert_eq!(sequential.0, vec!["K1", "K2"]);
    assert_eq!(sequential.1, vec!["[K2][K3]"]);
    assert_eq!(observe(text, true), sequential);
}

#[test]
fn fused_expansion_failure_under_error_off() {
    let text = "[Variables]\n%C%=%C%x\n[Process]\nSystem,ErrorOff,1\n\
        IniRead,a.ini,S,K0,%A%\nIniRead,a.ini,S,%C%,%B%\nIniRead,a.ini,S,K3,%D%\nEcho,done\n";
    let sequential = observe(text, false);
    assert_eq!(sequential.0, vec!["K0", "K3"]);
    assert_eq!(sequential.1, vec!["done"]);
    assert!(sequential.2.iter().any(|ev| ev.2 == LogState::Warning && ev.3.contains("(error suppressed)")));
    assert_eq!(observe(text, true), sequential);
}

#[test]
fn fused_expansion_failure_stops_later_members() {
    let text = "[Variables]\n%C%=%C%x\n[Process]\n\
        IniRead,a.ini,S,K0,%A%\nIniRead,a.ini,S,%C%,%B%\nIniRead,a.ini,S,K3,%D%\nEcho,never\n";
    let sequential = observe(text, false);
    assert_eq!(sequential.0, vec!["K0"]);
    assert!(sequential.1.is_empty());
    assert_eq!(observe(text, true), sequential);
}

#[test]
fn doubling_variable_does_not_hang() {
    let mut e = engine("[Variables]\n%A%=%A%%A%\n[Process]\nEcho,%A%\nEcho,after\n");
    let report = e.run();
    assert!(e.output.is_empty());
    assert_eq!(report.worst, LogState::Error);
}

#[test]
fn loop_to_max_index_terminates() {
    let mut e = engine("[Process]\nLoop,%ScriptFile%,Body,9223372036854775806,9223372036854775807\nEcho,end\n[Body]\nEcho,#c\n");
    e.run();
    assert_eq!(e.output, vec!["9223372036854775806", "9223372036854775807", "end"]);
}

#[test]
fn huge_param_destination_is_rejected() {
    let mut e = engine("[Process]\nSet,#4000000000,x\n");
    let report = e.run();
    assert_eq!(report.worst, LogState::ParserError);
    assert_eq!(report.exit_code(), 2);
}
