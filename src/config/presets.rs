/// Built-in language pipelines
///
/// Each language is a data record. Adding or overriding one is done through
/// the `languages` section of the service config, never by editing the
/// orchestrator.
use crate::pipeline::step::{LanguagePipeline, PipelineStep, StdinPolicy};

/// Default run-step deadline.
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 5_000;
/// Default deadline for ahead-of-time compile steps.
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 15_000;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn step(executable: &str, args: &[&str], timeout_ms: u64) -> PipelineStep {
    PipelineStep {
        executable: executable.to_string(),
        args: strings(args),
        timeout_ms,
    }
}

fn python3() -> LanguagePipeline {
    LanguagePipeline {
        id: "python".to_string(),
        name: "Python 3".to_string(),
        aliases: strings(&["py", "python3"]),
        source_file: "main.py".to_string(),
        compile: Vec::new(),
        // -B: don't litter the workspace with .pyc files
        run: step("python3", &["-B", "{source}"], DEFAULT_RUN_TIMEOUT_MS),
        stdin: StdinPolicy::Forward,
        environment: vec![("PYTHONIOENCODING".to_string(), "utf-8".to_string())],
    }
}

fn javascript() -> LanguagePipeline {
    LanguagePipeline {
        id: "javascript".to_string(),
        name: "JavaScript (Node.js)".to_string(),
        aliases: strings(&["js", "node"]),
        source_file: "main.js".to_string(),
        compile: Vec::new(),
        run: step("node", &["{source}"], DEFAULT_RUN_TIMEOUT_MS),
        stdin: StdinPolicy::Forward,
        environment: Vec::new(),
    }
}

fn cpp17() -> LanguagePipeline {
    LanguagePipeline {
        id: "cpp".to_string(),
        name: "C++17 (GCC)".to_string(),
        aliases: strings(&["c++", "cxx", "cc"]),
        source_file: "solution.cpp".to_string(),
        compile: vec![step(
            "g++",
            &["-std=c++17", "-O2", "-pipe", "-o", "{workdir}/solution", "{source}"],
            DEFAULT_COMPILE_TIMEOUT_MS,
        )],
        run: step("{workdir}/solution", &[], DEFAULT_RUN_TIMEOUT_MS),
        stdin: StdinPolicy::Forward,
        environment: Vec::new(),
    }
}

fn c11() -> LanguagePipeline {
    LanguagePipeline {
        id: "c".to_string(),
        name: "C11 (GCC)".to_string(),
        aliases: Vec::new(),
        source_file: "solution.c".to_string(),
        compile: vec![step(
            "gcc",
            &["-std=c11", "-O2", "-pipe", "-o", "{workdir}/solution", "{source}", "-lm"],
            DEFAULT_COMPILE_TIMEOUT_MS,
        )],
        run: step("{workdir}/solution", &[], DEFAULT_RUN_TIMEOUT_MS),
        stdin: StdinPolicy::Forward,
        environment: Vec::new(),
    }
}

fn java17() -> LanguagePipeline {
    LanguagePipeline {
        id: "java".to_string(),
        name: "Java (OpenJDK)".to_string(),
        aliases: Vec::new(),
        // javac requires the public class to match the file name
        source_file: "Main.java".to_string(),
        compile: vec![step("javac", &["-encoding", "UTF-8", "{source}"], 20_000)],
        run: step(
            "java",
            &["-Xss1m", "-XX:+UseSerialGC", "-cp", "{workdir}", "Main"],
            DEFAULT_RUN_TIMEOUT_MS,
        ),
        stdin: StdinPolicy::Forward,
        environment: vec![(
            "JAVA_TOOL_OPTIONS".to_string(),
            "-Dfile.encoding=UTF-8".to_string(),
        )],
    }
}

/// All built-in pipelines, in listing order.
pub fn builtin_pipelines() -> Vec<LanguagePipeline> {
    vec![python3(), javascript(), cpp17(), c11(), java17()]
}
