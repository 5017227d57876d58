//! 尺寸类表
//!
//! 小对象分配按尺寸类取整：8 字节步进到 128，16 步进到 512，
//! 64 步进到 1024，128 步进到 2048，256 步进到 4096（共 64 档）。
//! 超过 SMALL_CUTOFF 的对象绕过尺寸类，独占整 span。

/// 小对象上限；超过它走大对象路径
pub const SMALL_CUTOFF: usize = 4096;

/// 生成尺寸类表（递增）
pub fn build_size_classes() -> Vec<usize> {
    let mut classes = Vec::with_capacity(64);
    let mut size = 8usize;
    while size <= 128 {
        classes.push(size);
        size += 8;
    }
    let mut size = 144usize;
    while size <= 512 {
        classes.push(size);
        size += 16;
    }
    let mut size = 576usize;
    while size <= 1024 {
        classes.push(size);
        size += 64;
    }
    let mut size = 1152usize;
    while size <= 2048 {
        classes.push(size);
        size += 128;
    }
    let mut size = 2304usize;
    while size <= SMALL_CUTOFF {
        classes.push(size);
        size += 256;
    }
    classes
}

/// size 对应的尺寸类下标（size 必须 ≤ SMALL_CUTOFF）
pub fn size_class_for(classes: &[usize], size: usize) -> usize {
    debug_assert!(size <= SMALL_CUTOFF);
    match classes.binary_search(&size) {
        Ok(i) => i,
        Err(i) => i.min(classes.len() - 1),
    }
}

/// n 按 align 上取整（align 为 2 的幂）
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_table_shape() {
        let classes = build_size_classes();
        assert_eq!(classes.len(), 64);
        assert_eq!(classes[0], 8);
        assert_eq!(*classes.last().unwrap(), SMALL_CUTOFF);
        for w in classes.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_size_class_lookup() {
        let classes = build_size_classes();
        assert_eq!(classes[size_class_for(&classes, 1)], 8);
        assert_eq!(classes[size_class_for(&classes, 8)], 8);
        assert_eq!(classes[size_class_for(&classes, 9)], 16);
        assert_eq!(classes[size_class_for(&classes, 129)], 144);
        assert_eq!(classes[size_class_for(&classes, 4096)], 4096);
        // 每个请求尺寸都被取整到不小于它的类
        for size in 1..=SMALL_CUTOFF {
            let c = classes[size_class_for(&classes, size)];
            assert!(c >= size);
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 16), 16);
        assert_eq!(align_up(0, 8), 0);
    }
}
