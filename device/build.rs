fn main() {
    #[cfg(feature = "esp32")]
    embuild::espidf::sysenv::output();

    println!("cargo:rerun-if-changed=data.json");
}
