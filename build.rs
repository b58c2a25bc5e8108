use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

fn main() {
    println!("cargo:rerun-if-changed=bpf/");
    println!("cargo:rerun-if-changed=build.rs");

    // The kernel agent is only built on request.
    if env::var_os("CARGO_FEATURE_BPF").is_none() {
        return;
    }

    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        panic!("the bpf feature requires a Linux target");
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));

    let bpf_src = manifest_dir.join("bpf/blkwatch.bpf.c");
    let bpf_out = out_dir.join("blkwatch.bpf.o");

    let target_arch = match env::var("CARGO_CFG_TARGET_ARCH")
        .unwrap_or_default()
        .as_str()
    {
        "x86_64" => "x86",
        "aarch64" => "arm64",
        arch => {
            println!("cargo:warning=Unsupported BPF target arch: {arch}, defaulting to x86");
            "x86"
        }
    };

    // Prefer a checked-in header; otherwise dump the running kernel's BTF.
    let vmlinux_dir = match env::var_os("BLKWATCH_VMLINUX_DIR") {
        Some(dir) => PathBuf::from(dir),
        None if manifest_dir.join("bpf/include/vmlinux.h").exists() => {
            manifest_dir.join("bpf/include")
        }
        None => {
            generate_vmlinux_h(&out_dir.join("vmlinux.h"));
            out_dir.clone()
        }
    };

    let bpf_cflags = format!("-D__TARGET_ARCH_{target_arch}");

    let status = Command::new("clang")
        .args([
            "-O2",
            "-g",
            "-Wall",
            "-Werror",
            "-target",
            "bpf",
            &bpf_cflags,
            "-I",
            path_str(&vmlinux_dir),
            "-I",
            path_str(&manifest_dir.join("bpf/include")),
            "-c",
            path_str(&bpf_src),
            "-o",
            path_str(&bpf_out),
        ])
        .status()
        .expect("failed to execute clang - is it installed?");

    if !status.success() {
        eprintln!("BPF compilation failed with status: {status}");
        std::process::exit(1);
    }
}

fn generate_vmlinux_h(dest: &Path) {
    let file = File::create(dest).expect("creating vmlinux.h");
    let status = Command::new("bpftool")
        .args([
            "btf",
            "dump",
            "file",
            "/sys/kernel/btf/vmlinux",
            "format",
            "c",
        ])
        .stdout(Stdio::from(file))
        .status()
        .expect("failed to execute bpftool - is it installed?");

    if !status.success() {
        eprintln!("vmlinux.h generation failed with status: {status}");
        std::process::exit(1);
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("valid path")
}
