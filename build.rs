// Build script to compile GLSL compute kernels to SPIR-V

use std::path::Path;
use std::process::Command;

const KERNELS: &[&str] = &["copy", "sha256", "sha256_miner"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile kernels using glslc (part of Vulkan SDK)
    for name in KERNELS {
        compile_shader(
            &format!("shaders/{}.comp", name),
            &format!("shaders/{}.comp.spv", name),
        );
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg("-Ishaders")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} not compiled", e, input);
            eprintln!("Install Vulkan SDK or compile manually:");
            eprintln!("  glslc -Ishaders {} -o {}", input, output);
        }
    }
}
