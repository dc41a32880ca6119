// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: [&str; 2] = ["shaders/builtin.world.vert", "shaders/builtin.world.frag"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // The library never needs these; only the demo binary loads them at runtime
    for shader in SHADERS {
        compile_shader(shader, &format!("{}.spv", shader));
    }
}

fn compile_shader(input: &str, output: &str) {
    let result = Command::new("glslc")
        .arg(Path::new(input))
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=glslc failed on {} (exit code {:?}); the demo will not find {}",
                input,
                status.code(),
                output
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), shaders were not compiled", e);
            println!("cargo:warning=compile manually with: glslc {} -o {}", input, output);
        }
    }
}
