use rand::Rng;


/// Generates a random string of the specified length using printable ASCII characters.
pub fn random_string(length: usize) -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..length).map(|_| rng.random_range(33..127)).collect();
    String::from_utf8(bytes).unwrap()
}


pub fn random_alphanumeric_string(length: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}


/// Uniform random float in `[0, 1)`.
pub fn random_unit() -> f64 {
    let mut rng = rand::rng();
    rng.random_range(0.0..1.0)
}


/// Draws from a normal distribution with the given mean and standard
/// deviation using the Box-Muller transform.
///
/// Used by the reconnection back-off to jitter retry delays so that a
/// fleet of clients does not stampede a recovering server.
pub fn normal_variate(mean: f64, std_dev: f64) -> f64 {
    let mut rng = rand::rng();
    // u1 must stay away from zero so the log below is finite
    let u1: f64 = rng.random_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    mean + std_dev * z
}
