use vergen::EmitBuilder;

fn main() {
    // 生成构建信息（VERGEN_BUILD_DATE 用于 --version 输出）
    if let Err(e) = EmitBuilder::builder().build_date().build_timestamp().emit() {
        println!("cargo:warning=无法生成构建信息: {}", e);
        println!("cargo:rustc-env=VERGEN_BUILD_DATE=unknown");
    }
}
