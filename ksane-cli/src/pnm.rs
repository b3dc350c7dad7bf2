use anyhow::Context;
use ksane::Raster;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

pub fn write_ppm(path: &Path, raster: &Raster) -> anyhow::Result<()> {
    let dpath = path.display();

    let file = File::create(path).with_context(|| format!("creating file '{dpath}'"))?;
    let mut writer = BufWriter::new(file);
    encode_ppm(&mut writer, raster).with_context(|| format!("writing file '{dpath}'"))?;
    writer.flush().with_context(|| format!("writing file '{dpath}'"))?;

    Ok(())
}

/// Binary PPM (P6) with 8-bit samples.
pub fn encode_ppm<W: Write>(writer: &mut W, raster: &Raster) -> io::Result<()> {
    write!(writer, "P6\n{} {}\n255\n", raster.width(), raster.height())?;
    writer.write_all(raster.data())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_samples() {
        let mut raster = Raster::new(2, 1);
        raster.fill_white();

        let mut bytes = Vec::new();
        encode_ppm(&mut bytes, &raster).unwrap();

        assert_eq!(&bytes[..11], b"P6\n2 1\n255\n");
        assert_eq!(&bytes[11..], &[0xff; 6]);
    }
}
